//! External collaborators
//!
//! The runtime only meets these at their interfaces: a project store that
//! persists user projects, and an authentication provider that announces
//! sign-in and sign-out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("project store rejected the request: {0}")]
    Rejected(String),
    #[error("project store unavailable: {0}")]
    Unavailable(String),
}

/// Persists project payloads per user
pub trait ProjectStore {
    fn save(
        &mut self,
        user_id: &str,
        project_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// In-process store, keyed by user then project
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, user_id: &str, project_id: &str) -> Option<&serde_json::Value> {
        self.projects.get(user_id)?.get(project_id)
    }

    /// Project ids saved by `user_id`, sorted
    pub fn projects(&self, user_id: &str) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .projects
            .get(user_id)
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl ProjectStore for MemoryProjectStore {
    fn save(
        &mut self,
        user_id: &str,
        project_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        if user_id.is_empty() {
            return Err(StoreError::Rejected("missing user id".to_string()));
        }
        if project_id.is_empty() {
            return Err(StoreError::Rejected("missing project id".to_string()));
        }
        log::debug!("saving project {} for {}", project_id, user_id);
        self.projects
            .entry(user_id.to_string())
            .or_default()
            .insert(project_id.to_string(), payload);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut,
}

/// Listener id returned by [`AuthEvents::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&AuthEvent)>;

/// Fans authentication events out to registered listeners
#[derive(Default)]
pub struct AuthEvents {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
    current_user: Option<String>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&AuthEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Deliver `event` to every listener in subscription order
    pub fn emit(&mut self, event: AuthEvent) {
        self.current_user = match &event {
            AuthEvent::SignedIn { user_id } => Some(user_id.clone()),
            AuthEvent::SignedOut => None,
        };
        log::info!("auth event: {:?}", event);
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }

    pub fn current_user(&self) -> Option<&str> {
        self.current_user.as_deref()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

//! Runtime configuration
//!
//! Every field has a default, so a config can be built from a partial JSON
//! document:
//!
//! ```
//! use solver_host::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "max_open_files": 16 }"#).unwrap();
//! assert_eq!(config.max_open_files, 16);
//! assert_eq!(config.max_symlink_follows, 40);
//! ```

use crate::error::ConfigError;
use crate::memory::{MAX_MEMORY, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default program name reported through `_` in the environment
pub const DEFAULT_PROGRAM_NAME: &str = "./this.program";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Initial linear memory size in bytes, rounded up to a page
    pub initial_memory: u32,
    /// Growth ceiling in bytes, never above 2^31
    pub max_memory: u32,
    /// Bytes reserved for call-scoped stack allocations
    pub stack_size: u32,
    /// Descriptor table capacity
    pub max_open_files: usize,
    /// Symlink follows allowed while resolving a single path
    pub max_symlink_follows: usize,
    /// Extra environment variables, overriding the defaults
    pub environment: BTreeMap<String, String>,
    pub program_name: String,
    /// Default location of the module binary (path or URL)
    pub module_source: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_memory: 16 * 1024 * 1024,
            max_memory: MAX_MEMORY,
            stack_size: 64 * 1024,
            max_open_files: 4096,
            max_symlink_follows: 40,
            environment: BTreeMap::new(),
            program_name: DEFAULT_PROGRAM_NAME.to_string(),
            module_source: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON config document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory > MAX_MEMORY {
            return Err(invalid(format!(
                "max_memory {} exceeds the 2^31 byte ceiling",
                self.max_memory
            )));
        }
        if self.max_memory < PAGE_SIZE {
            return Err(invalid("max_memory must hold at least one page"));
        }
        if self.initial_memory > self.max_memory {
            return Err(invalid("initial_memory exceeds max_memory"));
        }
        if self.stack_size == 0 || self.stack_size % 16 != 0 {
            return Err(invalid("stack_size must be a non-zero multiple of 16"));
        }
        if self.max_open_files < 3 {
            return Err(invalid("max_open_files must cover the three standard streams"));
        }
        Ok(())
    }

    /// `KEY=VALUE` strings in the order the module sees them
    ///
    /// Defaults come first in a fixed order; configured variables replace a
    /// default of the same name in place and are otherwise appended.
    pub fn environment_strings(&self) -> Vec<String> {
        let mut vars: Vec<(String, String)> = [
            ("USER", "web_user"),
            ("LOGNAME", "web_user"),
            ("PATH", "/"),
            ("PWD", "/"),
            ("HOME", "/home/web_user"),
            ("LANG", "C.UTF-8"),
            ("_", self.program_name.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        for (key, value) in &self.environment {
            match vars.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => vars.push((key.clone(), value.clone())),
            }
        }

        vars.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

//! Module loader
//!
//! Takes a module from its source to a ready [`Module`]:
//!
//! ```text
//! Unloaded -> Fetching -> Instantiating -> Ready
//!                  \            \
//!                   +------------+--> Failed
//! ```
//!
//! Acquiring the bytes is the only asynchronous step. Everything after it
//! (validation, building the runtime, instantiation, filesystem
//! initialisation and static constructors) runs synchronously inside the
//! poll that sees the bytes arrive. A loader is consumed by [`Loader::load`],
//! so each runtime is loaded at most once and a failed load is final.

pub mod native;
pub mod validate;

pub use native::{Instantiate, NativeModule};
pub use validate::{ModuleInfo, ModuleValidator, WasmBuilder};

use crate::abi::imports::ImportTable;
use crate::abi::Module;
use crate::abi::exports::CALL_CTORS;
use crate::error::{LoadError, LoadResult};
use crate::platform::{self, PlatformError};
use crate::runtime::RuntimeBuilder;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Where the module binary comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Url(String),
}

impl ModuleSource {
    /// `http://` and `https://` locations are fetched, anything else is a path
    pub fn from_location(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ModuleSource::Url(location.to_string())
        } else {
            ModuleSource::Path(PathBuf::from(location))
        }
    }

    fn describe(&self) -> String {
        match self {
            ModuleSource::Bytes(bytes) => format!("{} bytes", bytes.len()),
            ModuleSource::Path(path) => path.display().to_string(),
            ModuleSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Unloaded,
    Fetching,
    Instantiating,
    Ready,
    Failed(LoadError),
}

/// Shared view of a load's progress
#[derive(Debug, Clone)]
pub struct LoadStatus(Rc<RefCell<LoadState>>);

impl LoadStatus {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(LoadState::Unloaded)))
    }

    pub fn get(&self) -> LoadState {
        self.0.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.0.borrow(), LoadState::Ready)
    }

    fn set(&self, state: LoadState) {
        log::info!("module load: {:?}", state);
        *self.0.borrow_mut() = state;
    }
}

/// Everything needed once the bytes have arrived
struct Stage<I> {
    builder: RuntimeBuilder,
    instantiator: I,
    imports: ImportTable,
}

impl<I: Instantiate> Stage<I> {
    fn finish(self, bytes: &[u8]) -> LoadResult<Module> {
        let info = ModuleValidator::validate(bytes, &self.imports)?;
        let mut runtime = self.builder.build()?;
        let exports = self
            .instantiator
            .instantiate(&info, bytes, &mut runtime, &self.imports)?;
        for (name, _) in info.function_exports() {
            if !exports.contains(name) {
                return Err(LoadError::MissingExport {
                    name: name.to_string(),
                });
            }
        }

        runtime.initialize()?;
        if exports.contains(CALL_CTORS) {
            exports.get(CALL_CTORS)?.call(&mut runtime, &[])?;
        }
        Ok(Module::new(runtime, exports))
    }
}

/// Loads one module into a fresh runtime
pub struct Loader<I> {
    builder: RuntimeBuilder,
    instantiator: I,
    imports: ImportTable,
    status: LoadStatus,
}

impl<I: Instantiate> Loader<I> {
    pub fn new(instantiator: I) -> Self {
        Self {
            builder: RuntimeBuilder::new(),
            instantiator,
            imports: ImportTable::standard(),
            status: LoadStatus::new(),
        }
    }

    /// Configure the runtime the module is loaded into
    pub fn runtime(mut self, builder: RuntimeBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn status(&self) -> LoadStatus {
        self.status.clone()
    }

    /// Start loading from `source`
    pub fn load(self, source: ModuleSource) -> LoadTask<I> {
        log::info!("loading module from {}", source.describe());
        self.status.set(LoadState::Fetching);
        LoadTask {
            acquire: acquire(source).boxed_local(),
            stage: Some(Stage {
                builder: self.builder,
                instantiator: self.instantiator,
                imports: self.imports,
            }),
            status: self.status,
        }
    }

    /// Load from the configured `module_source`
    pub fn load_configured(self) -> LoadTask<I> {
        let source = self.builder.module_source().map(ModuleSource::from_location);
        match source {
            Some(source) => self.load(source),
            None => {
                let error = LoadError::Unsupported {
                    what: "no module source configured".to_string(),
                };
                self.status.set(LoadState::Failed(error.clone()));
                LoadTask {
                    acquire: futures::future::ready(Err(error)).boxed_local(),
                    stage: None,
                    status: self.status,
                }
            }
        }
    }
}

pin_project_lite::pin_project! {
    /// A load in progress; resolves to the ready module or the error that
    /// stopped it
    pub struct LoadTask<I> {
        #[pin]
        acquire: LocalBoxFuture<'static, LoadResult<Vec<u8>>>,
        stage: Option<Stage<I>>,
        status: LoadStatus,
    }
}

impl<I> LoadTask<I> {
    pub fn status(&self) -> LoadStatus {
        self.status.clone()
    }
}

impl<I: Instantiate> Future for LoadTask<I> {
    type Output = LoadResult<Module>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.stage.is_none() {
            return Poll::Ready(Err(match this.status.get() {
                LoadState::Failed(error) => error,
                _ => LoadError::Instantiation {
                    reason: "load task polled after completion".to_string(),
                },
            }));
        }

        let acquired = match this.acquire.poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match (acquired, this.stage.take()) {
            (Ok(bytes), Some(stage)) => {
                this.status.set(LoadState::Instantiating);
                stage.finish(&bytes)
            }
            (Err(error), _) => Err(error),
            (Ok(_), None) => Err(LoadError::Instantiation {
                reason: "load task polled after completion".to_string(),
            }),
        };

        match &result {
            Ok(_) => this.status.set(LoadState::Ready),
            Err(error) => {
                log::error!("module load failed: {}", error);
                this.status.set(LoadState::Failed(error.clone()));
            }
        }
        Poll::Ready(result)
    }
}

async fn acquire(source: ModuleSource) -> LoadResult<Vec<u8>> {
    match source {
        ModuleSource::Bytes(bytes) => Ok(bytes),
        ModuleSource::Path(path) => read_path(path),
        ModuleSource::Url(url) => platform::fetch_bytes(&url).await.map_err(|e| match e {
            PlatformError::NotSupported(what) => LoadError::Unsupported { what },
            other => LoadError::Fetch {
                url,
                reason: other.to_string(),
            },
        }),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn read_path(path: PathBuf) -> LoadResult<Vec<u8>> {
    std::fs::read(&path).map_err(|e| LoadError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(target_arch = "wasm32")]
fn read_path(path: PathBuf) -> LoadResult<Vec<u8>> {
    Err(LoadError::Unsupported {
        what: format!("reading {} from a local filesystem", path.display()),
    })
}

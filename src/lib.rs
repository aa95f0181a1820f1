//! solver-host - Host runtime for a sandboxed numerical solver module
//!
//! The module sees a small POSIX-like world, all of it owned by one
//! [`Runtime`]:
//! - Linear memory with a heap allocator and a LIFO stack region
//! - An in-memory filesystem with terminal, random and null devices
//! - Syscall and WASI imports over that filesystem
//!
//! The host drives the module through typed calls ([`Module::invoke`]) or
//! the [`Solver`] facade, after the [`Loader`] has brought it to ready.
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): console output, `fetch` for the module
//! - Native: stdout/stderr, local module files

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod abi;
pub mod boundary;
pub mod config;
pub mod devices;
pub mod error;
pub mod loader;
pub mod memory;
pub mod platform;
pub mod runtime;
pub mod solver;
pub mod syscall;
pub mod vfs;

pub use abi::{Arg, Module, Ret, ReturnKind};
pub use config::RuntimeConfig;
pub use error::{Errno, LoadError, RuntimeError};
pub use loader::{Instantiate, LoadState, Loader, ModuleSource, NativeModule};
pub use runtime::{Runtime, RuntimeBuilder};
pub use solver::{LinearProgram, Solution, Solver};

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn start() {
    init_panic_hook();
}

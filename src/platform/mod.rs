//! Platform Abstraction Layer
//!
//! Everything that touches the host environment lives here:
//!
//! - Console sinks for terminal output (stdout/stderr, or the browser console)
//! - The terminal input source (stdin, or `window.prompt`)
//! - Wall and monotonic clocks
//! - Fetching the module binary (browser only)
//!
//! The rest of the crate is host-agnostic and goes through these functions.

#[cfg(not(target_arch = "wasm32"))]
mod native;
#[cfg(not(target_arch = "wasm32"))]
pub use native::*;

#[cfg(target_arch = "wasm32")]
pub mod web;
#[cfg(target_arch = "wasm32")]
pub use web::*;

use thiserror::Error;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Platform-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Which console stream a terminal prints to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Out,
    Err,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clocks_advance() {
        let wall = now_ms();
        assert!(wall > 1.0e12, "wall clock should be ms since the epoch");
        let a = perf_now();
        let b = perf_now();
        assert!(b >= a);
    }
}

//! Error types for the host runtime
//!
//! Three layers, matching the three kinds of caller:
//!
//! - [`Errno`]: the numeric code space seen by the module's libc. VFS, device
//!   and syscall code reports failures only through these.
//! - [`RuntimeError`]: failures surfaced to host code calling into the module
//!   (memory access, allocator misuse, marshalling, traps).
//! - [`LoadError`]: terminal failures of a module load attempt.

use thiserror::Error;

/// Result type for filesystem, device and descriptor operations
pub type FsResult<T> = Result<T, Errno>;

/// Result type for host-facing runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Result type for module loading
pub type LoadResult<T> = Result<T, LoadError>;

/// Error numbers written to the module's errno slot
///
/// Values follow the WASI numbering the module's libc was compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum Errno {
    #[error("permission denied")]
    Access = 2,
    #[error("resource temporarily unavailable")]
    Again = 6,
    #[error("bad file descriptor")]
    BadFd = 8,
    #[error("device or resource busy")]
    Busy = 10,
    #[error("file exists")]
    Exists = 20,
    #[error("bad address")]
    Fault = 21,
    #[error("file too large")]
    FileTooBig = 22,
    #[error("invalid argument")]
    Invalid = 28,
    #[error("i/o error")]
    Io = 29,
    #[error("is a directory")]
    IsDir = 31,
    #[error("too many levels of symbolic links")]
    Loop = 32,
    #[error("too many open files")]
    TooManyFiles = 33,
    #[error("no such device")]
    NoDevice = 43,
    #[error("no such file or directory")]
    NoEntry = 44,
    #[error("out of memory")]
    NoMemory = 48,
    #[error("not a directory")]
    NotDir = 54,
    #[error("directory not empty")]
    NotEmpty = 55,
    #[error("operation not supported")]
    NotSupported = 58,
    #[error("not a terminal")]
    NotTty = 59,
    #[error("no such device or address")]
    NoDeviceOrAddress = 60,
    #[error("value too large for defined data type")]
    Overflow = 61,
    #[error("operation not permitted")]
    Perm = 63,
    #[error("result out of range")]
    Range = 68,
    #[error("illegal seek")]
    IllegalSeek = 70,
}

impl Errno {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let errno = match code {
            2 => Self::Access,
            6 => Self::Again,
            8 => Self::BadFd,
            10 => Self::Busy,
            20 => Self::Exists,
            21 => Self::Fault,
            22 => Self::FileTooBig,
            28 => Self::Invalid,
            29 => Self::Io,
            31 => Self::IsDir,
            32 => Self::Loop,
            33 => Self::TooManyFiles,
            43 => Self::NoDevice,
            44 => Self::NoEntry,
            48 => Self::NoMemory,
            54 => Self::NotDir,
            55 => Self::NotEmpty,
            58 => Self::NotSupported,
            59 => Self::NotTty,
            60 => Self::NoDeviceOrAddress,
            61 => Self::Overflow,
            63 => Self::Perm,
            68 => Self::Range,
            70 => Self::IllegalSeek,
            _ => return None,
        };
        Some(errno)
    }
}

impl From<RuntimeError> for Errno {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Fs(errno) => errno,
            RuntimeError::OutOfMemory { .. } | RuntimeError::StackOverflow { .. } => {
                Errno::NoMemory
            }
            _ => Errno::Fault,
        }
    }
}

/// Errors surfaced to host code driving the module
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("memory access out of bounds: address {address} + size {size} > memory size {memory_size}")]
    OutOfBounds {
        address: u64,
        size: u64,
        memory_size: u32,
    },

    #[error("misaligned {width}-byte view at offset {offset:#x}")]
    Misaligned { offset: u32, width: usize },

    #[error("out of memory: cannot grow linear memory to {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("stack overflow: requested {requested} bytes with {available} available")]
    StackOverflow { requested: u32, available: u32 },

    #[error("stack restored to {mark:#x} out of order (innermost mark is {expected:?})")]
    StackImbalance { mark: u32, expected: Option<u32> },

    #[error("free of unallocated offset {offset:#x}")]
    InvalidFree { offset: u32 },

    #[error("unknown export '{name}'")]
    UnknownExport { name: String },

    #[error("export '{name}' takes {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("export '{name}' argument {index}: expected {expected}")]
    ArgumentType {
        name: String,
        index: usize,
        expected: &'static str,
    },

    #[error("export '{name}' returned {got}, expected {expected}")]
    ReturnType {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid problem: {reason}")]
    InvalidProblem { reason: String },

    #[error("module trapped: {reason}")]
    Trap { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("filesystem error: {0}")]
    Fs(#[from] Errno),
}

/// Terminal failures of a module load attempt
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("malformed module: {reason}")]
    Malformed { reason: String },

    #[error("module does not export '{name}'")]
    MissingExport { name: String },

    #[error("unresolved import '{module}.{name}'")]
    UnresolvedImport { module: String, name: String },

    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("not supported on this host: {what}")]
    Unsupported { what: String },

    #[error("instantiation failed: {reason}")]
    Instantiation { reason: String },

    #[error("runtime initialisation failed: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Configuration parse or validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::BadFd.code(), 8);
        assert_eq!(Errno::TooManyFiles.code(), 33);
        assert_eq!(Errno::from_code(44), Some(Errno::NoEntry));
        assert_eq!(Errno::from_code(70), Some(Errno::IllegalSeek));
        assert_eq!(Errno::from_code(-1), None);
        assert_eq!(Errno::from_code(1000), None);
    }

    #[test]
    fn test_errno_display() {
        assert_eq!(Errno::Loop.to_string(), "too many levels of symbolic links");
        let err: RuntimeError = Errno::NoEntry.into();
        assert_eq!(err.to_string(), "filesystem error: no such file or directory");
    }

    #[test]
    fn test_runtime_error_to_errno() {
        let oob = RuntimeError::OutOfBounds {
            address: 1 << 20,
            size: 4,
            memory_size: 65536,
        };
        assert_eq!(Errno::from(oob), Errno::Fault);
        assert_eq!(
            Errno::from(RuntimeError::OutOfMemory { requested: 1 << 31 }),
            Errno::NoMemory
        );
        assert_eq!(Errno::from(RuntimeError::Fs(Errno::Loop)), Errno::Loop);
    }

    #[test]
    fn test_load_error_wraps_runtime_error() {
        let err: LoadError = RuntimeError::OutOfMemory { requested: 1 << 32 }.into();
        assert!(matches!(err, LoadError::Runtime(RuntimeError::OutOfMemory { .. })));
    }
}

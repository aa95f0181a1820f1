//! Runtime context
//!
//! A [`Runtime`] owns every piece of state the module can observe: linear
//! memory, the allocator, the filesystem (with its device and descriptor
//! tables), the errno slot and the environment. Nothing is process-global;
//! each loaded module gets its own runtime.
//!
//! Construction happens in two steps:
//!
//! 1. [`RuntimeBuilder::build`] lays out memory and creates the initial tree
//!    (`/tmp`, `/home/web_user`, `/dev/*`, `/proc/self/fd`).
//! 2. [`Runtime::initialize`] opens descriptors 0, 1 and 2 and turns on
//!    permission checks. The loader calls it once the module is
//!    instantiated.

use crate::config::RuntimeConfig;
use crate::devices::{
    BytePull, BytePush, DeviceId, Driver, LineSink, LineSource, RandomSource, StreamDevice, Tty,
};
use crate::error::{Errno, RuntimeError, RuntimeResult};
use crate::memory::allocator::ERRNO_CELL;
use crate::memory::{Allocation, Allocator, LinearMemory, StackMark};
use crate::platform::{self, ConsoleStream};
use crate::vfs::{DIR_MODE, MountKind, OpenFlags, Vfs};

/// Host overrides for the standard streams
///
/// A byte callback replaces the corresponding `/dev/std*` node with a stream
/// device. Without one, stdin and stdout go through `/dev/tty` and stderr
/// through `/dev/tty1`, whose line handlers can be replaced as well.
#[derive(Default)]
pub struct StandardStreams {
    pub stdin: Option<BytePull>,
    pub stdout: Option<BytePush>,
    pub stderr: Option<BytePush>,
    pub terminal_input: Option<Box<dyn LineSource>>,
    pub terminal_output: Option<Box<dyn LineSink>>,
    pub terminal_error: Option<Box<dyn LineSink>>,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    streams: StandardStreams,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            streams: StandardStreams::default(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Module location from the configuration, if any
    pub fn module_source(&self) -> Option<&str> {
        self.config.module_source.as_deref()
    }

    pub fn stdin(mut self, pull: BytePull) -> Self {
        self.streams.stdin = Some(pull);
        self
    }

    pub fn stdout(mut self, push: BytePush) -> Self {
        self.streams.stdout = Some(push);
        self
    }

    pub fn stderr(mut self, push: BytePush) -> Self {
        self.streams.stderr = Some(push);
        self
    }

    /// Line source behind `/dev/tty` input
    pub fn terminal_input(mut self, source: impl LineSource + 'static) -> Self {
        self.streams.terminal_input = Some(Box::new(source));
        self
    }

    /// Line sink behind `/dev/tty` output
    pub fn terminal_output(mut self, sink: impl LineSink + 'static) -> Self {
        self.streams.terminal_output = Some(Box::new(sink));
        self
    }

    /// Line sink behind `/dev/tty1`
    pub fn terminal_error(mut self, sink: impl LineSink + 'static) -> Self {
        self.streams.terminal_error = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> RuntimeResult<Runtime> {
        let config = self.config;
        config.validate().map_err(|e| RuntimeError::Config {
            reason: e.to_string(),
        })?;

        let allocator = Allocator::new(config.stack_size);
        let initial = config.initial_memory.max(allocator.heap_base());
        let memory = LinearMemory::new(initial, config.max_memory)?;
        let vfs = Vfs::new(config.max_open_files, config.max_symlink_follows);

        let mut runtime = Runtime {
            memory,
            allocator,
            vfs,
            last_errno: None,
            environment: config.environment_strings(),
            config,
            initialized: false,
        };
        runtime.create_tree(self.streams)?;
        Ok(runtime)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Runtime {
    pub(crate) memory: LinearMemory,
    pub(crate) allocator: Allocator,
    pub(crate) vfs: Vfs,
    last_errno: Option<Errno>,
    environment: Vec<String>,
    config: RuntimeConfig,
    initialized: bool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    fn create_tree(&mut self, streams: StandardStreams) -> RuntimeResult<()> {
        let vfs = &mut self.vfs;
        for dir in ["/tmp", "/home", "/home/web_user", "/dev"] {
            vfs.mkdir(dir, DIR_MODE)?;
        }

        let devices = vfs.devices_mut();
        devices.register(DeviceId::NULL, Driver::Null);
        devices.register(DeviceId::RANDOM, Driver::Random(RandomSource::new()));
        devices.register(DeviceId::URANDOM, Driver::Random(RandomSource::new()));
        devices.register(
            DeviceId::TTY,
            Driver::Tty(Tty::new(
                Some(streams.terminal_input.unwrap_or_else(platform::stdin_lines)),
                Some(
                    streams
                        .terminal_output
                        .unwrap_or_else(|| platform::console(ConsoleStream::Out)),
                ),
            )),
        );
        devices.register(
            DeviceId::TTY1,
            Driver::Tty(Tty::new(
                None,
                Some(
                    streams
                        .terminal_error
                        .unwrap_or_else(|| platform::console(ConsoleStream::Err)),
                ),
            )),
        );

        vfs.mkdev("/dev/null", 0o666, DeviceId::NULL)?;
        vfs.mkdev("/dev/random", 0o666, DeviceId::RANDOM)?;
        vfs.mkdev("/dev/urandom", 0o666, DeviceId::URANDOM)?;
        vfs.mkdev("/dev/tty", 0o666, DeviceId::TTY)?;
        vfs.mkdev("/dev/tty1", 0o666, DeviceId::TTY1)?;
        vfs.mkdir_all("/dev/shm/tmp")?;

        vfs.mkdir_all("/proc/self/fd")?;
        vfs.mount("/proc/self/fd", MountKind::DescriptorLinks)?;

        match streams.stdin {
            Some(pull) => {
                let id = vfs
                    .devices_mut()
                    .register_dynamic(Driver::Stream(StreamDevice::new(Some(pull), None)));
                vfs.mkdev("/dev/stdin", 0o444, id)?;
            }
            None => {
                vfs.symlink("/dev/tty", "/dev/stdin")?;
            }
        }
        match streams.stdout {
            Some(push) => {
                let id = vfs
                    .devices_mut()
                    .register_dynamic(Driver::Stream(StreamDevice::new(None, Some(push))));
                vfs.mkdev("/dev/stdout", 0o222, id)?;
            }
            None => {
                vfs.symlink("/dev/tty", "/dev/stdout")?;
            }
        }
        match streams.stderr {
            Some(push) => {
                let id = vfs
                    .devices_mut()
                    .register_dynamic(Driver::Stream(StreamDevice::new(None, Some(push))));
                vfs.mkdev("/dev/stderr", 0o222, id)?;
            }
            None => {
                vfs.symlink("/dev/tty1", "/dev/stderr")?;
            }
        }
        Ok(())
    }

    /// Open the standard descriptors and enforce permissions from now on
    ///
    /// Calling it again has no effect.
    pub fn initialize(&mut self) -> RuntimeResult<()> {
        if self.initialized {
            return Ok(());
        }
        let stdin = self.vfs.open("/dev/stdin", OpenFlags::RDONLY, 0)?;
        let stdout = self.vfs.open("/dev/stdout", OpenFlags::WRONLY, 0)?;
        let stderr = self.vfs.open("/dev/stderr", OpenFlags::WRONLY, 0)?;
        if (stdin, stdout, stderr) != (0, 1, 2) {
            return Err(RuntimeError::Trap {
                reason: format!(
                    "standard streams opened as {}, {}, {}",
                    stdin, stdout, stderr
                ),
            });
        }
        self.vfs.set_ignore_permissions(false);
        self.initialized = true;
        log::debug!("runtime initialised");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut self.memory
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut Vfs {
        &mut self.vfs
    }

    pub fn environment(&self) -> &[String] {
        &self.environment
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    pub fn alloc(&mut self, size: u32) -> RuntimeResult<Allocation> {
        self.allocator.alloc(&mut self.memory, size)
    }

    pub fn free(&mut self, offset: u32) -> RuntimeResult<()> {
        self.allocator.free(offset)
    }

    pub fn stack_save(&mut self) -> StackMark {
        self.allocator.stack_save()
    }

    pub fn stack_alloc(&mut self, size: u32) -> RuntimeResult<u32> {
        self.allocator.stack_alloc(size)
    }

    pub fn stack_restore(&mut self, mark: StackMark) -> RuntimeResult<()> {
        self.allocator.stack_restore(mark)
    }

    pub fn stack_unwind(&mut self, mark: StackMark) -> RuntimeResult<usize> {
        self.allocator.unwind_to(mark)
    }

    // ========================================================================
    // Errno
    // ========================================================================

    /// Most recent syscall failure
    pub fn last_errno(&self) -> Option<Errno> {
        self.last_errno
    }

    /// Offset of the errno cell the module's `__errno_location` points at
    pub fn errno_location(&self) -> u32 {
        ERRNO_CELL
    }

    pub(crate) fn set_errno(&mut self, errno: Errno) {
        self.last_errno = Some(errno);
        // The cell sits in the first page, which always exists
        let _ = self.memory.write_i32(ERRNO_CELL, errno.code());
    }

    /// Build the error an `abort` import raises
    pub fn abort(&mut self, what: &str) -> RuntimeError {
        log::warn!("module aborted: {}", what);
        RuntimeError::Trap {
            reason: format!("abort({})", what),
        }
    }
}

//! Device drivers
//!
//! A device node in the VFS carries only a [`DeviceId`]; reads and writes on
//! it are dispatched to the [`Driver`] registered for that id.
//!
//! | Path           | Id     | Driver                                 |
//! |----------------|--------|----------------------------------------|
//! | `/dev/null`    | (1, 3) | discards writes, reads end of file      |
//! | `/dev/random`  | (1, 8) | host entropy                            |
//! | `/dev/urandom` | (1, 9) | host entropy                            |
//! | `/dev/tty`     | (5, 0) | line terminal: stdin source, stdout sink |
//! | `/dev/tty1`    | (6, 0) | line terminal: stderr sink, no input    |
//!
//! Host-supplied standard streams become byte [`StreamDevice`]s with majors
//! allocated from 64 upward.

pub mod random;
pub mod tty;

pub use random::RandomSource;
pub use tty::{CapturedLines, LineSink, LineSource, ScriptedInput, Tty};

use crate::error::{Errno, FsResult};
use std::collections::HashMap;
use std::io;

/// Major/minor device number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const NULL: DeviceId = DeviceId::new(1, 3);
    pub const RANDOM: DeviceId = DeviceId::new(1, 8);
    pub const URANDOM: DeviceId = DeviceId::new(1, 9);
    pub const TTY: DeviceId = DeviceId::new(5, 0);
    pub const TTY1: DeviceId = DeviceId::new(6, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Packed form reported as `st_rdev`
    pub fn encode(&self) -> u32 {
        (self.major << 8) | self.minor
    }

    pub fn decode(raw: u32) -> Self {
        Self::new(raw >> 8, raw & 0xff)
    }
}

/// Pulls one byte; `Ok(None)` is end of input, `WouldBlock` means no data yet
pub type BytePull = Box<dyn FnMut() -> io::Result<Option<u8>>>;

/// Pushes one byte
pub type BytePush = Box<dyn FnMut(u8) -> io::Result<()>>;

/// Unbuffered byte stream built from host callbacks
pub struct StreamDevice {
    pull: Option<BytePull>,
    push: Option<BytePush>,
}

impl StreamDevice {
    pub fn new(pull: Option<BytePull>, push: Option<BytePush>) -> Self {
        Self { pull, push }
    }

    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let pull = self.pull.as_mut().ok_or(Errno::NotSupported)?;
        let mut read = 0;
        while read < buf.len() {
            match pull() {
                Ok(Some(byte)) => {
                    buf[read] = byte;
                    read += 1;
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if read == 0 {
                        return Err(Errno::Again);
                    }
                    break;
                }
                Err(e) => {
                    log::warn!("stream device read failed: {}", e);
                    return Err(Errno::Io);
                }
            }
        }
        Ok(read)
    }

    fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        let push = self.push.as_mut().ok_or(Errno::NotSupported)?;
        for &byte in data {
            push(byte).map_err(|e| {
                log::warn!("stream device write failed: {}", e);
                Errno::Io
            })?;
        }
        Ok(data.len())
    }
}

pub enum Driver {
    Null,
    Random(RandomSource),
    Tty(Tty),
    Stream(StreamDevice),
}

impl Driver {
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        match self {
            Driver::Null => Ok(0),
            Driver::Random(source) => {
                source.fill(buf);
                Ok(buf.len())
            }
            Driver::Tty(tty) => tty.read(buf),
            Driver::Stream(stream) => stream.read(buf),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        match self {
            Driver::Null => Ok(data.len()),
            Driver::Random(_) => Err(Errno::NotSupported),
            Driver::Tty(tty) => tty.write(data),
            Driver::Stream(stream) => stream.write(data),
        }
    }

    /// Called when a descriptor on the device is closed
    pub fn flush(&mut self) -> FsResult<()> {
        match self {
            Driver::Tty(tty) => tty.flush(),
            _ => Ok(()),
        }
    }

    pub fn is_tty(&self) -> bool {
        matches!(self, Driver::Tty(_))
    }

    /// Bytes readable without blocking, for `FIONREAD`
    pub fn pending_input(&self) -> usize {
        match self {
            Driver::Tty(tty) => tty.pending_input(),
            _ => 0,
        }
    }
}

/// Registered drivers by device id
pub struct DeviceTable {
    drivers: HashMap<DeviceId, Driver>,
    next_major: u32,
}

impl DeviceTable {
    /// First major handed out to host-registered devices
    pub const FIRST_DYNAMIC_MAJOR: u32 = 64;

    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
            next_major: Self::FIRST_DYNAMIC_MAJOR,
        }
    }

    pub fn register(&mut self, id: DeviceId, driver: Driver) {
        self.drivers.insert(id, driver);
    }

    /// Register under a fresh major number
    pub fn register_dynamic(&mut self, driver: Driver) -> DeviceId {
        let id = DeviceId::new(self.next_major, 0);
        self.next_major += 1;
        self.register(id, driver);
        id
    }

    pub fn get(&self, id: DeviceId) -> FsResult<&Driver> {
        self.drivers.get(&id).ok_or(Errno::NoDevice)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> FsResult<&mut Driver> {
        self.drivers.get_mut(&id).ok_or(Errno::NoDevice)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

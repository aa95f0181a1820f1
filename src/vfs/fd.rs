//! Open files and the descriptor table

use super::node::NodeId;
use crate::error::{Errno, FsResult};

/// `open` flags as passed by the module's libc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(0);
    pub const WRONLY: OpenFlags = OpenFlags(1);
    pub const RDWR: OpenFlags = OpenFlags(2);
    pub const CREAT: OpenFlags = OpenFlags(0o100);
    pub const EXCL: OpenFlags = OpenFlags(0o200);
    pub const NOCTTY: OpenFlags = OpenFlags(0o400);
    pub const TRUNC: OpenFlags = OpenFlags(0o1000);
    pub const APPEND: OpenFlags = OpenFlags(0o2000);
    pub const NONBLOCK: OpenFlags = OpenFlags(0o4000);
    pub const DIRECTORY: OpenFlags = OpenFlags(0o200000);
    pub const NOFOLLOW: OpenFlags = OpenFlags(0o400000);
    pub const CLOEXEC: OpenFlags = OpenFlags(0o2000000);
    pub const PATH: OpenFlags = OpenFlags(0o10000000);

    /// Access mode bits, including `O_PATH`
    pub const ACCMODE: i32 = 3 | Self::PATH.0;

    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | other.0)
    }

    pub fn without(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 & !other.0)
    }

    pub fn access_mode(&self) -> i32 {
        self.0 & Self::ACCMODE
    }

    pub fn is_read(&self) -> bool {
        self.access_mode() != Self::WRONLY.0
    }

    pub fn is_write(&self) -> bool {
        self.access_mode() != Self::RDONLY.0
    }
}

/// Origin for `lseek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    pub fn from_raw(whence: i32) -> FsResult<Self> {
        match whence {
            0 => Ok(Self::Set),
            1 => Ok(Self::Current),
            2 => Ok(Self::End),
            _ => Err(Errno::Invalid),
        }
    }
}

/// An open descriptor's state
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub node: NodeId,
    pub flags: OpenFlags,
    pub position: u64,
    /// Devices are streams; only files and directories seek
    pub seekable: bool,
    /// Resolved path at open time
    pub path: String,
}

/// Descriptor table
///
/// New descriptors always take the lowest free number, so a closed number is
/// the first to be handed out again.
pub struct FdTable {
    entries: Vec<Option<OpenFile>>,
    capacity: usize,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Install `file` at the lowest free descriptor not below `min_fd`
    pub fn allocate(&mut self, file: OpenFile, min_fd: usize) -> FsResult<i32> {
        let free = (min_fd..self.capacity).find(|&fd| self.entries.get(fd).is_none_or(|e| e.is_none()));
        let fd = free.ok_or(Errno::TooManyFiles)?;

        if fd >= self.entries.len() {
            self.entries.resize_with(fd + 1, || None);
        }
        self.entries[fd] = Some(file);
        Ok(fd as i32)
    }

    pub fn get(&self, fd: i32) -> FsResult<&OpenFile> {
        usize::try_from(fd)
            .ok()
            .and_then(|fd| self.entries.get(fd))
            .and_then(|e| e.as_ref())
            .ok_or(Errno::BadFd)
    }

    pub fn get_mut(&mut self, fd: i32) -> FsResult<&mut OpenFile> {
        usize::try_from(fd)
            .ok()
            .and_then(|fd| self.entries.get_mut(fd))
            .and_then(|e| e.as_mut())
            .ok_or(Errno::BadFd)
    }

    pub fn remove(&mut self, fd: i32) -> FsResult<OpenFile> {
        let slot = usize::try_from(fd)
            .ok()
            .and_then(|fd| self.entries.get_mut(fd))
            .ok_or(Errno::BadFd)?;
        let file = slot.take().ok_or(Errno::BadFd)?;

        while matches!(self.entries.last(), Some(None)) {
            self.entries.pop();
        }
        Ok(file)
    }

    /// Open descriptors in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (i32, &OpenFile)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(fd, e)| e.as_ref().map(|f| (fd as i32, f)))
    }

    pub fn open_count(&self) -> usize {
        self.iter().count()
    }

    pub fn references(&self, node: NodeId) -> bool {
        self.iter().any(|(_, f)| f.node == node)
    }
}

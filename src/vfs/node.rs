//! VFS nodes
//!
//! Nodes live in a slab arena and refer to each other by [`NodeId`]. A
//! directory maps names to child ids; every node records its parent id so
//! paths can be rebuilt without owning back-references.

use crate::devices::DeviceId;
use crate::error::{Errno, FsResult};
use std::collections::HashMap;

/// File type mask and type bits of `mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Permission bits kept by `chmod`
pub const PERM_MASK: u32 = 0o7777;

/// Permission classes checked against any of user/group/other
pub const MAY_READ: u32 = 0o444;
pub const MAY_WRITE: u32 = 0o222;
pub const MAY_EXEC: u32 = 0o111;

/// Block size reported by stat
pub const BLOCK_SIZE: u32 = 4096;

/// Files at or above this capacity grow by 12.5% instead of doubling
const CAPACITY_DOUBLING_MAX: usize = 1024 * 1024;

/// Largest size a regular file may reach
pub const MAX_FILE_SIZE: u64 = 1 << 31;

/// Index of a node in the VFS arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug)]
pub enum NodeKind {
    Directory { entries: HashMap<String, NodeId> },
    File { data: Vec<u8> },
    Symlink { target: String },
    Device { rdev: DeviceId },
}

#[derive(Debug)]
pub struct VNode {
    pub name: String,
    /// The root is its own parent
    pub parent: NodeId,
    /// Type and permission bits
    pub mode: u32,
    /// 0 once unlinked; the node survives while descriptors still use it
    pub nlink: u32,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub kind: NodeKind,
}

impl VNode {
    pub fn new(name: &str, parent: NodeId, mode: u32, kind: NodeKind, now: f64) -> Self {
        Self {
            name: name.to_string(),
            parent,
            mode,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    pub fn device(&self) -> Option<DeviceId> {
        match self.kind {
            NodeKind::Device { rdev } => Some(rdev),
            _ => None,
        }
    }

    /// Size as reported by stat
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory { .. } => BLOCK_SIZE as u64,
            NodeKind::File { data } => data.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            NodeKind::Device { .. } => 0,
        }
    }
}

/// Grow a file buffer's capacity to hold `needed` bytes
///
/// Doubles below 1 MiB and grows by 12.5% above, never below 256 bytes once
/// the file has any capacity. Sizes past [`MAX_FILE_SIZE`] are refused and a
/// failed host allocation is reported as `NoMemory`.
pub fn reserve_file_capacity(data: &mut Vec<u8>, needed: usize) -> FsResult<()> {
    if needed as u64 > MAX_FILE_SIZE {
        return Err(Errno::FileTooBig);
    }
    let capacity = data.capacity();
    if needed <= capacity {
        return Ok(());
    }

    let factor_grown = if capacity < CAPACITY_DOUBLING_MAX {
        capacity * 2
    } else {
        capacity + capacity / 8
    };
    let mut target = needed.max(factor_grown);
    if capacity != 0 {
        target = target.max(256);
    }
    let target = target.min(MAX_FILE_SIZE as usize).max(needed);
    data.try_reserve_exact(target - data.len())
        .map_err(|_| Errno::NoMemory)
}

/// Metadata returned by stat-family calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    pub dev: u32,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u32,
    /// Milliseconds since the Unix epoch
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_char_device(&self) -> bool {
        self.mode & S_IFMT == S_IFCHR
    }
}

//! `struct stat` as laid out in module memory

use crate::vfs::Stat;
use bytemuck::{Pod, Zeroable};

/// Stat record (96 bytes)
///
/// Field order and widths match the module libc's `struct stat`; the layout
/// has no padding so it can be copied into memory as raw bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StatBuf {
    pub dev: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: i64,
    pub blksize: u32,
    pub blocks: u32,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
    pub ino: u64,
}

impl StatBuf {
    pub const SIZE: usize = 96;
}

/// Split milliseconds since the epoch into seconds and nanoseconds
fn split_ms(ms: f64) -> (i64, i64) {
    let ms = ms.max(0.0) as i64;
    (ms / 1000, (ms % 1000) * 1_000_000)
}

impl From<&Stat> for StatBuf {
    fn from(stat: &Stat) -> Self {
        let (atime_sec, atime_nsec) = split_ms(stat.atime);
        let (mtime_sec, mtime_nsec) = split_ms(stat.mtime);
        let (ctime_sec, ctime_nsec) = split_ms(stat.ctime);
        Self {
            dev: stat.dev,
            mode: stat.mode,
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev,
            size: stat.size as i64,
            blksize: stat.blksize,
            blocks: stat.blocks,
            atime_sec,
            atime_nsec,
            mtime_sec,
            mtime_nsec,
            ctime_sec,
            ctime_nsec,
            ino: stat.ino,
        }
    }
}

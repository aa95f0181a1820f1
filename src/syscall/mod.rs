//! Syscall layer
//!
//! The calls the module's libc imports, implemented over the runtime's VFS
//! and linear memory. Arguments are raw integers; strings and buffers are
//! offsets into linear memory.
//!
//! Nothing here returns an error to the module. A failing `sys_*` call
//! records its [`Errno`] (see [`Runtime::last_errno`]) and returns `-1`.
//! The WASI-shaped `fd_*` and `environ_*` calls return the code itself, `0`
//! meaning success.

pub mod flags;
pub mod libc;
pub mod stat;

use crate::error::{Errno, FsResult, RuntimeResult};
use crate::platform;
use crate::runtime::Runtime;
use crate::vfs::{Stat, path};
use bytemuck::{Pod, Zeroable};
use flags::{AT_EMPTY_PATH, AT_FDCWD, AT_REMOVEDIR, AT_SYMLINK_NOFOLLOW, OpenFlags, Whence};
use flags::{fcntl, ioctl};
use stat::StatBuf;

/// One scatter/gather buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Iovec {
    pub base: u32,
    pub len: u32,
}

impl Iovec {
    pub const SIZE: u32 = 8;
}

/// Window size reported to `TIOCGWINSZ`: rows, columns, x and y pixels
const WINSIZE: [u16; 4] = [24, 80, 0, 0];

impl Runtime {
    fn finish(&mut self, call: &str, result: FsResult<i32>) -> i32 {
        match result {
            Ok(value) => value,
            Err(errno) => {
                log::debug!("{} failed: {}", call, errno);
                self.set_errno(errno);
                -1
            }
        }
    }

    fn finish_wasi(&mut self, call: &str, result: FsResult<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(errno) => {
                log::debug!("{} failed: {}", call, errno);
                self.set_errno(errno);
                errno.code()
            }
        }
    }

    fn path_arg(&self, ptr: u32) -> FsResult<String> {
        let path = self.memory.read_cstring(ptr)?;
        if path.is_empty() {
            return Err(Errno::NoEntry);
        }
        Ok(path)
    }

    /// Path relative to `dirfd`, or to the working directory for `AT_FDCWD`
    fn at_path(&self, dirfd: i32, ptr: u32) -> FsResult<String> {
        let path = self.path_arg(ptr)?;
        if path::is_absolute(&path) || dirfd == AT_FDCWD {
            return Ok(path);
        }
        let dir = self.vfs.fd(dirfd)?;
        if !self.vfs.node(dir.node).is_dir() {
            return Err(Errno::NotDir);
        }
        Ok(path::join(&dir.path, &path))
    }

    fn write_stat(&mut self, buf: u32, stat: &Stat) -> FsResult<i32> {
        self.memory.write_pod(buf, &StatBuf::from(stat))?;
        Ok(0)
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    pub fn sys_open(&mut self, path_ptr: u32, flags: i32, mode: u32) -> i32 {
        self.sys_openat(AT_FDCWD, path_ptr, flags, mode)
    }

    pub fn sys_openat(&mut self, dirfd: i32, path_ptr: u32, flags: i32, mode: u32) -> i32 {
        let result = self
            .at_path(dirfd, path_ptr)
            .and_then(|path| self.vfs.open(&path, OpenFlags(flags), mode));
        self.finish("open", result)
    }

    pub fn sys_close(&mut self, fd: i32) -> i32 {
        let result = self.vfs.close(fd).map(|()| 0);
        self.finish("close", result)
    }

    pub fn sys_dup(&mut self, fd: i32) -> i32 {
        let result = self.vfs.dup(fd, 0);
        self.finish("dup", result)
    }

    fn read_into(&mut self, fd: i32, buf: u32, len: u32, offset: Option<u64>) -> FsResult<i32> {
        let len = len.min(i32::MAX as u32);
        let dest = self.memory.slice_mut::<u8>(buf, len)?;
        let count = self.vfs.read(fd, dest, offset)?;
        Ok(count as i32)
    }

    fn write_from(&mut self, fd: i32, buf: u32, len: u32, offset: Option<u64>) -> FsResult<i32> {
        let len = len.min(i32::MAX as u32);
        let src = self.memory.slice::<u8>(buf, len)?;
        let count = self.vfs.write(fd, src, offset)?;
        Ok(count as i32)
    }

    pub fn sys_read(&mut self, fd: i32, buf: u32, len: u32) -> i32 {
        let result = self.read_into(fd, buf, len, None);
        self.finish("read", result)
    }

    pub fn sys_write(&mut self, fd: i32, buf: u32, len: u32) -> i32 {
        let result = self.write_from(fd, buf, len, None);
        self.finish("write", result)
    }

    pub fn sys_pread(&mut self, fd: i32, buf: u32, len: u32, offset: i64) -> i32 {
        let result = u64::try_from(offset)
            .map_err(|_| Errno::Invalid)
            .and_then(|offset| self.read_into(fd, buf, len, Some(offset)));
        self.finish("pread", result)
    }

    pub fn sys_pwrite(&mut self, fd: i32, buf: u32, len: u32, offset: i64) -> i32 {
        let result = u64::try_from(offset)
            .map_err(|_| Errno::Invalid)
            .and_then(|offset| self.write_from(fd, buf, len, Some(offset)));
        self.finish("pwrite", result)
    }

    fn iovecs(&self, iov: u32, iovcnt: i32) -> FsResult<Vec<Iovec>> {
        let count = u32::try_from(iovcnt).map_err(|_| Errno::Invalid)?;
        (0..count)
            .map(|i| -> FsResult<Iovec> {
                let at = iov as u64 + i as u64 * Iovec::SIZE as u64;
                let at = u32::try_from(at).map_err(|_| Errno::Fault)?;
                Ok(self.memory.read_pod::<Iovec>(at)?)
            })
            .collect()
    }

    /// Fill buffers in order, stopping at the first short read
    fn readv(&mut self, fd: i32, iov: u32, iovcnt: i32) -> FsResult<i32> {
        let mut total: i32 = 0;
        for vec in self.iovecs(iov, iovcnt)? {
            let count = self.read_into(fd, vec.base, vec.len, None)?;
            total = total.checked_add(count).ok_or(Errno::Overflow)?;
            if (count as u32) < vec.len {
                break;
            }
        }
        Ok(total)
    }

    fn writev(&mut self, fd: i32, iov: u32, iovcnt: i32) -> FsResult<i32> {
        let mut total: i32 = 0;
        for vec in self.iovecs(iov, iovcnt)? {
            let count = self.write_from(fd, vec.base, vec.len, None)?;
            total = total.checked_add(count).ok_or(Errno::Overflow)?;
            if (count as u32) < vec.len {
                break;
            }
        }
        Ok(total)
    }

    pub fn sys_readv(&mut self, fd: i32, iov: u32, iovcnt: i32) -> i32 {
        let result = self.readv(fd, iov, iovcnt);
        self.finish("readv", result)
    }

    pub fn sys_writev(&mut self, fd: i32, iov: u32, iovcnt: i32) -> i32 {
        let result = self.writev(fd, iov, iovcnt);
        self.finish("writev", result)
    }

    pub fn fd_read(&mut self, fd: i32, iov: u32, iovcnt: i32, nread_ptr: u32) -> i32 {
        let result = self.readv(fd, iov, iovcnt).and_then(|count| -> FsResult<()> {
            self.memory.write_u32(nread_ptr, count as u32)?;
            Ok(())
        });
        self.finish_wasi("fd_read", result)
    }

    pub fn fd_write(&mut self, fd: i32, iov: u32, iovcnt: i32, nwritten_ptr: u32) -> i32 {
        let result = self.writev(fd, iov, iovcnt).and_then(|count| -> FsResult<()> {
            self.memory.write_u32(nwritten_ptr, count as u32)?;
            Ok(())
        });
        self.finish_wasi("fd_write", result)
    }

    pub fn fd_close(&mut self, fd: i32) -> i32 {
        let result = self.vfs.close(fd);
        self.finish_wasi("fd_close", result)
    }

    pub fn sys_lseek(&mut self, fd: i32, offset: i64, whence: i32) -> i64 {
        let result = Whence::from_raw(whence).and_then(|whence| self.vfs.seek(fd, offset, whence));
        match result {
            Ok(position) => position as i64,
            Err(errno) => {
                log::debug!("lseek failed: {}", errno);
                self.set_errno(errno);
                -1
            }
        }
    }

    /// `lseek` storing the new 64-bit position at `new_offset_ptr`
    pub fn fd_seek(&mut self, fd: i32, offset: i64, whence: i32, new_offset_ptr: u32) -> i32 {
        let result = Whence::from_raw(whence)
            .and_then(|whence| self.vfs.seek(fd, offset, whence))
            .and_then(|position| -> FsResult<()> {
                self.memory.write_u64(new_offset_ptr, position)?;
                Ok(())
            });
        self.finish_wasi("fd_seek", result)
    }

    pub fn sys_ioctl(&mut self, fd: i32, request: u32, arg: u32) -> i32 {
        let result = self.ioctl(fd, request, arg);
        self.finish("ioctl", result)
    }

    /// Terminal queries only; a few requests succeed without effect
    fn ioctl(&mut self, fd: i32, request: u32, arg: u32) -> FsResult<i32> {
        let driver = self.vfs.fd_driver(fd)?;
        let is_tty = driver.is_some_and(|d| d.is_tty());
        let pending = driver.map(|d| d.pending_input()).unwrap_or(0);

        let terminal_only = |ok: bool| if ok { Ok(()) } else { Err(Errno::NotTty) };
        match request {
            ioctl::TCGETS
            | ioctl::TCGETA
            | ioctl::TCSETS
            | ioctl::TCSETSW
            | ioctl::TCSETSF
            | ioctl::TCSETA
            | ioctl::TCSETAW
            | ioctl::TCSETAF
            | ioctl::TIOCSWINSZ => {
                terminal_only(is_tty)?;
                Ok(0)
            }
            ioctl::TIOCGPGRP => {
                terminal_only(is_tty)?;
                if arg != 0 {
                    self.memory.write_i32(arg, 0)?;
                }
                Ok(0)
            }
            ioctl::TIOCSPGRP => {
                terminal_only(is_tty)?;
                Err(Errno::Invalid)
            }
            ioctl::TIOCGWINSZ => {
                terminal_only(is_tty)?;
                if arg != 0 {
                    self.memory.write_pod(arg, &WINSIZE)?;
                }
                Ok(0)
            }
            ioctl::FIONREAD => {
                terminal_only(is_tty)?;
                self.memory.write_i32(arg, pending as i32)?;
                Ok(0)
            }
            _ => {
                log::warn!("unsupported ioctl {:#x} on fd {}", request, fd);
                Err(Errno::NotSupported)
            }
        }
    }

    pub fn sys_fcntl(&mut self, fd: i32, cmd: i32, arg: i32) -> i32 {
        let result = self.fcntl(fd, cmd, arg);
        self.finish("fcntl", result)
    }

    fn fcntl(&mut self, fd: i32, cmd: i32, arg: i32) -> FsResult<i32> {
        let flags = self.vfs.fd(fd)?.flags;
        match cmd {
            fcntl::F_DUPFD => {
                let min_fd = usize::try_from(arg).map_err(|_| Errno::Invalid)?;
                self.vfs.dup(fd, min_fd)
            }
            fcntl::F_GETFD | fcntl::F_SETFD => Ok(0),
            fcntl::F_GETFL => Ok(flags.0),
            fcntl::F_SETFL => {
                self.vfs.fd_mut(fd)?.flags = flags.with(OpenFlags(arg));
                Ok(0)
            }
            fcntl::F_GETLK | fcntl::F_GETLK64 => {
                // No locks are ever held, so nothing conflicts
                self.memory.write_i16(arg as u32, fcntl::F_UNLCK)?;
                Ok(0)
            }
            fcntl::F_SETLK | fcntl::F_SETLKW | fcntl::F_SETLK64 | fcntl::F_SETLKW64 => Ok(0),
            // No signal-driven I/O
            fcntl::F_GETOWN | fcntl::F_SETOWN => Err(Errno::Invalid),
            _ => Err(Errno::Invalid),
        }
    }

    pub fn sys_ftruncate(&mut self, fd: i32, len: i64) -> i32 {
        let result = u64::try_from(len)
            .map_err(|_| Errno::Invalid)
            .and_then(|len| self.vfs.ftruncate(fd, len))
            .map(|()| 0);
        self.finish("ftruncate", result)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn sys_stat(&mut self, path_ptr: u32, buf: u32) -> i32 {
        let result = self
            .path_arg(path_ptr)
            .and_then(|path| self.vfs.stat(&path))
            .and_then(|stat| self.write_stat(buf, &stat));
        self.finish("stat", result)
    }

    pub fn sys_lstat(&mut self, path_ptr: u32, buf: u32) -> i32 {
        let result = self
            .path_arg(path_ptr)
            .and_then(|path| self.vfs.lstat(&path))
            .and_then(|stat| self.write_stat(buf, &stat));
        self.finish("lstat", result)
    }

    pub fn sys_fstat(&mut self, fd: i32, buf: u32) -> i32 {
        let result = self
            .vfs
            .fstat(fd)
            .and_then(|stat| self.write_stat(buf, &stat));
        self.finish("fstat", result)
    }

    pub fn sys_newfstatat(&mut self, dirfd: i32, path_ptr: u32, buf: u32, flags: i32) -> i32 {
        let result = self.fstatat(dirfd, path_ptr, buf, flags);
        self.finish("newfstatat", result)
    }

    fn fstatat(&mut self, dirfd: i32, path_ptr: u32, buf: u32, flags: i32) -> FsResult<i32> {
        if flags & !(AT_SYMLINK_NOFOLLOW | AT_EMPTY_PATH) != 0 {
            return Err(Errno::Invalid);
        }
        let raw = self.memory.read_cstring(path_ptr)?;
        let stat = if raw.is_empty() && flags & AT_EMPTY_PATH != 0 && dirfd != AT_FDCWD {
            self.vfs.fstat(dirfd)?
        } else {
            let path = self.at_path(dirfd, path_ptr)?;
            if flags & AT_SYMLINK_NOFOLLOW != 0 {
                self.vfs.lstat(&path)?
            } else {
                self.vfs.stat(&path)?
            }
        };
        self.write_stat(buf, &stat)
    }

    pub fn sys_chmod(&mut self, path_ptr: u32, mode: u32) -> i32 {
        let result = self
            .path_arg(path_ptr)
            .and_then(|path| self.vfs.chmod(&path, mode))
            .map(|()| 0);
        self.finish("chmod", result)
    }

    pub fn sys_truncate(&mut self, path_ptr: u32, len: i64) -> i32 {
        let result = u64::try_from(len)
            .map_err(|_| Errno::Invalid)
            .and_then(|len| {
                let path = self.path_arg(path_ptr)?;
                self.vfs.truncate(&path, len)
            })
            .map(|()| 0);
        self.finish("truncate", result)
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    pub fn sys_mkdir(&mut self, path_ptr: u32, mode: u32) -> i32 {
        self.sys_mkdirat(AT_FDCWD, path_ptr, mode)
    }

    pub fn sys_mkdirat(&mut self, dirfd: i32, path_ptr: u32, mode: u32) -> i32 {
        let result = self
            .at_path(dirfd, path_ptr)
            .and_then(|path| self.vfs.mkdir(&path, mode))
            .map(|_| 0);
        self.finish("mkdir", result)
    }

    pub fn sys_rmdir(&mut self, path_ptr: u32) -> i32 {
        self.sys_unlinkat(AT_FDCWD, path_ptr, AT_REMOVEDIR)
    }

    pub fn sys_unlink(&mut self, path_ptr: u32) -> i32 {
        self.sys_unlinkat(AT_FDCWD, path_ptr, 0)
    }

    pub fn sys_unlinkat(&mut self, dirfd: i32, path_ptr: u32, flags: i32) -> i32 {
        let result = self.at_path(dirfd, path_ptr).and_then(|path| match flags {
            0 => self.vfs.unlink(&path),
            AT_REMOVEDIR => self.vfs.rmdir(&path),
            _ => Err(Errno::Invalid),
        });
        self.finish("unlink", result.map(|()| 0))
    }

    pub fn sys_rename(&mut self, old_ptr: u32, new_ptr: u32) -> i32 {
        self.sys_renameat(AT_FDCWD, old_ptr, AT_FDCWD, new_ptr)
    }

    pub fn sys_renameat(&mut self, old_dirfd: i32, old_ptr: u32, new_dirfd: i32, new_ptr: u32) -> i32 {
        let result = self.at_path(old_dirfd, old_ptr).and_then(|old| {
            let new = self.at_path(new_dirfd, new_ptr)?;
            self.vfs.rename(&old, &new)
        });
        self.finish("rename", result.map(|()| 0))
    }

    /// Create a link at `link_ptr` whose target is stored verbatim
    pub fn sys_symlink(&mut self, target_ptr: u32, link_ptr: u32) -> i32 {
        self.sys_symlinkat(target_ptr, AT_FDCWD, link_ptr)
    }

    pub fn sys_symlinkat(&mut self, target_ptr: u32, dirfd: i32, link_ptr: u32) -> i32 {
        let result = self.path_arg(target_ptr).and_then(|target| {
            let link = self.at_path(dirfd, link_ptr)?;
            self.vfs.symlink(&target, &link)
        });
        self.finish("symlink", result.map(|_| 0))
    }

    pub fn sys_readlink(&mut self, path_ptr: u32, buf: u32, bufsize: i32) -> i32 {
        self.sys_readlinkat(AT_FDCWD, path_ptr, buf, bufsize)
    }

    /// Copy the link target without a terminator, truncated to `bufsize`
    pub fn sys_readlinkat(&mut self, dirfd: i32, path_ptr: u32, buf: u32, bufsize: i32) -> i32 {
        let result = self.readlinkat(dirfd, path_ptr, buf, bufsize);
        self.finish("readlink", result)
    }

    fn readlinkat(&mut self, dirfd: i32, path_ptr: u32, buf: u32, bufsize: i32) -> FsResult<i32> {
        if bufsize <= 0 {
            return Err(Errno::Invalid);
        }
        let path = self.at_path(dirfd, path_ptr)?;
        let target = self.vfs.readlink(&path)?;
        let count = target.len().min(bufsize as usize);
        self.memory.write(buf, &target.as_bytes()[..count])?;
        Ok(count as i32)
    }

    /// Returns the bytes written including the terminator
    pub fn sys_getcwd(&mut self, buf: u32, size: u32) -> i32 {
        let result = self.getcwd(buf, size);
        self.finish("getcwd", result)
    }

    fn getcwd(&mut self, buf: u32, size: u32) -> FsResult<i32> {
        if size == 0 {
            return Err(Errno::Invalid);
        }
        let cwd = self.vfs.cwd().to_string();
        if cwd.len() as u64 + 1 > size as u64 {
            return Err(Errno::Range);
        }
        Ok(self.memory.write_cstring(buf, &cwd)? as i32)
    }

    pub fn sys_chdir(&mut self, path_ptr: u32) -> i32 {
        let result = self
            .path_arg(path_ptr)
            .and_then(|path| self.vfs.chdir(&path))
            .map(|()| 0);
        self.finish("chdir", result)
    }

    // ========================================================================
    // Environment and clocks
    // ========================================================================

    /// Store the variable count and the bytes `environ_get` needs
    pub fn environ_sizes_get(&mut self, count_ptr: u32, buf_size_ptr: u32) -> i32 {
        let count = self.environment().len() as u32;
        let size: usize = self.environment().iter().map(|var| var.len() + 1).sum();
        let result = self
            .memory
            .write_u32(count_ptr, count)
            .and_then(|()| self.memory.write_u32(buf_size_ptr, size as u32))
            .map_err(Errno::from);
        self.finish_wasi("environ_sizes_get", result)
    }

    /// Write `KEY=value` strings at `buf_ptr` and a pointer to each at `environ_ptr`
    pub fn environ_get(&mut self, environ_ptr: u32, buf_ptr: u32) -> i32 {
        let result = self.write_environ(environ_ptr, buf_ptr);
        self.finish_wasi("environ_get", result)
    }

    fn write_environ(&mut self, environ_ptr: u32, buf_ptr: u32) -> FsResult<()> {
        let vars = self.environment().to_vec();
        let mut slot = environ_ptr;
        let mut at = buf_ptr;
        for var in &vars {
            self.memory.write_u32(slot, at)?;
            at = at
                .checked_add(self.memory.write_cstring(at, var)?)
                .ok_or(Errno::Fault)?;
            slot = slot.checked_add(4).ok_or(Errno::Fault)?;
        }
        Ok(())
    }

    /// Wall clock in milliseconds since the epoch
    pub fn clock_now_ms(&self) -> f64 {
        platform::now_ms()
    }

    /// Monotonic clock in milliseconds
    pub fn perf_now(&self) -> f64 {
        platform::perf_now()
    }

    // ========================================================================
    // Memory hooks
    // ========================================================================

    /// Overlapping copy within linear memory
    pub fn memcpy_big(&mut self, dest: u32, src: u32, len: u32) -> RuntimeResult<()> {
        self.memory.copy_within(dest, src, len)
    }

    /// Grow memory to hold `requested` bytes; 1 on success, 0 otherwise
    pub fn resize_heap(&mut self, requested: u32) -> i32 {
        match self.memory.grow(requested as u64) {
            Ok(size) => {
                log::debug!("heap resized to {} bytes", size);
                1
            }
            Err(e) => {
                log::debug!("heap resize to {} failed: {}", requested, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{CapturedLines, ScriptedInput};
    use crate::memory::MAX_MEMORY;

    const O_RDONLY: i32 = 0;
    const O_WRONLY: i32 = 1;
    const O_RDWR: i32 = 2;
    const O_CREAT: i32 = 0o100;

    fn runtime() -> (Runtime, CapturedLines) {
        let out = CapturedLines::new();
        let mut rt = Runtime::builder()
            .terminal_input(ScriptedInput::new(["first line"]))
            .terminal_output(out.clone())
            .terminal_error(CapturedLines::new())
            .build()
            .unwrap();
        rt.initialize().unwrap();
        (rt, out)
    }

    fn cstr(rt: &mut Runtime, text: &str) -> u32 {
        let block = rt.alloc(text.len() as u32 + 1).unwrap();
        rt.memory_mut().write_cstring(block.offset, text).unwrap();
        block.offset
    }

    fn bytes(rt: &mut Runtime, data: &[u8]) -> u32 {
        let block = rt.alloc(data.len() as u32).unwrap();
        rt.memory_mut().write(block.offset, data).unwrap();
        block.offset
    }

    fn errno_cell(rt: &Runtime) -> i32 {
        rt.memory().read_i32(rt.errno_location()).unwrap()
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let (mut rt, _) = runtime();
        let dir = cstr(&mut rt, "/work");
        assert_eq!(rt.sys_mkdir(dir, 0o777), 0);

        let file = cstr(&mut rt, "/work/a.txt");
        let fd = rt.sys_open(file, O_CREAT | O_RDWR, 0o644);
        assert_eq!(fd, 3);
        let data = bytes(&mut rt, b"hello");
        assert_eq!(rt.sys_write(fd, data, 5), 5);
        assert_eq!(rt.sys_close(fd), 0);

        let fd = rt.sys_open(file, O_RDONLY, 0);
        let buf = rt.alloc(10).unwrap().offset;
        assert_eq!(rt.sys_read(fd, buf, 10), 5);
        assert_eq!(rt.memory().read_bytes(buf, 5).unwrap(), b"hello");
        assert_eq!(rt.sys_read(fd, buf, 10), 0);
        assert_eq!(rt.last_errno(), None);
    }

    #[test]
    fn test_lseek_on_terminal_fails() {
        let (mut rt, _) = runtime();
        assert_eq!(rt.sys_lseek(0, 0, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::IllegalSeek));
        assert_eq!(errno_cell(&rt), 70);

        let ptr = rt.alloc(8).unwrap().offset;
        assert_eq!(rt.fd_seek(1, 0, 1, ptr), 70);
    }

    #[test]
    fn test_lseek_and_fd_seek() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/seek");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        let data = bytes(&mut rt, b"0123456789");
        rt.sys_write(fd, data, 10);

        assert_eq!(rt.sys_lseek(fd, -3, 2), 7);
        assert_eq!(rt.sys_lseek(fd, 1, 1), 8);
        assert_eq!(rt.sys_lseek(fd, 0, 9), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));

        let ptr = rt.alloc(8).unwrap().offset;
        assert_eq!(rt.fd_seek(fd, 2, 0, ptr), 0);
        assert_eq!(rt.memory().read_i64(ptr).unwrap(), 2);
    }

    #[test]
    fn test_write_to_stdout_reaches_terminal() {
        let (mut rt, out) = runtime();
        let msg = bytes(&mut rt, b"solved\npartial");
        assert_eq!(rt.sys_write(1, msg, 14), 14);
        assert_eq!(out.lines(), vec!["solved"]);
        assert_eq!(rt.sys_close(1), 0);
        assert_eq!(out.lines(), vec!["solved", "partial"]);
    }

    #[test]
    fn test_read_stdin_line() {
        let (mut rt, _) = runtime();
        let buf = rt.alloc(64).unwrap().offset;
        assert_eq!(rt.sys_read(0, buf, 64), 11);
        assert_eq!(rt.memory().read_bytes(buf, 11).unwrap(), b"first line\n");
    }

    #[test]
    fn test_fd_write_gathers_iovecs() {
        let (mut rt, out) = runtime();
        let a = bytes(&mut rt, b"ab");
        let b = bytes(&mut rt, b"c\n");
        let iov = rt.alloc(16).unwrap().offset;
        rt.memory_mut()
            .write_pod(iov, &[Iovec { base: a, len: 2 }, Iovec { base: b, len: 2 }])
            .unwrap();
        let nwritten = rt.alloc(4).unwrap().offset;

        assert_eq!(rt.fd_write(1, iov, 2, nwritten), 0);
        assert_eq!(rt.memory().read_u32(nwritten).unwrap(), 4);
        assert_eq!(out.lines(), vec!["abc"]);
    }

    #[test]
    fn test_readv_stops_on_short_read() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/v");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        let data = bytes(&mut rt, b"xyz");
        rt.sys_write(fd, data, 3);
        rt.sys_lseek(fd, 0, 0);

        let first = rt.alloc(2).unwrap().offset;
        let second = rt.alloc(8).unwrap().offset;
        let third = rt.alloc(8).unwrap().offset;
        let iov = rt.alloc(24).unwrap().offset;
        rt.memory_mut()
            .write_pod(
                iov,
                &[
                    Iovec { base: first, len: 2 },
                    Iovec { base: second, len: 8 },
                    Iovec { base: third, len: 8 },
                ],
            )
            .unwrap();
        assert_eq!(rt.sys_readv(fd, iov, 3), 3);
        assert_eq!(rt.memory().read_bytes(first, 2).unwrap(), b"xy");
        assert_eq!(rt.memory().read_bytes(second, 1).unwrap(), b"z");
    }

    #[test]
    fn test_pread_leaves_position() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/p");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        let data = bytes(&mut rt, b"abcdef");
        rt.sys_write(fd, data, 6);

        let buf = rt.alloc(4).unwrap().offset;
        assert_eq!(rt.sys_pread(fd, buf, 2, 3), 2);
        assert_eq!(rt.memory().read_bytes(buf, 2).unwrap(), b"de");
        assert_eq!(rt.sys_lseek(fd, 0, 1), 6);
        assert_eq!(rt.sys_pread(fd, buf, 2, -1), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));
        assert_eq!(rt.sys_pread(0, buf, 2, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::IllegalSeek));
    }

    #[test]
    fn test_write_to_read_only_descriptor() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/ro");
        let fd = rt.sys_open(path, O_CREAT | O_RDONLY, 0o644);
        let data = bytes(&mut rt, b"x");
        assert_eq!(rt.sys_write(fd, data, 1), -1);
        assert_eq!(rt.last_errno(), Some(Errno::BadFd));
        assert_eq!(rt.sys_write(99, data, 1), -1);
        assert_eq!(rt.last_errno(), Some(Errno::BadFd));
    }

    #[test]
    fn test_bad_pointer_is_fault() {
        let (mut rt, _) = runtime();
        let len = rt.memory().len();
        assert_eq!(rt.sys_write(1, len - 2, 8), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Fault));
    }

    #[test]
    fn test_ioctl_terminal_queries() {
        let (mut rt, _) = runtime();
        let arg = rt.alloc(8).unwrap().offset;
        assert_eq!(rt.sys_ioctl(1, ioctl::TCGETS, arg), 0);
        assert_eq!(rt.sys_ioctl(1, ioctl::TCSETSW, arg), 0);

        assert_eq!(rt.sys_ioctl(1, ioctl::TIOCGWINSZ, arg), 0);
        let winsize: [u16; 4] = rt.memory().read_pod(arg).unwrap();
        assert_eq!(winsize, [24, 80, 0, 0]);

        assert_eq!(rt.sys_ioctl(1, ioctl::TIOCSPGRP, arg), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));

        assert_eq!(rt.sys_ioctl(1, 0x1234, arg), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NotSupported));
    }

    #[test]
    fn test_ioctl_fionread_counts_buffered_input() {
        let (mut rt, _) = runtime();
        let buf = rt.alloc(4).unwrap().offset;
        assert_eq!(rt.sys_read(0, buf, 4), 4);

        let arg = rt.alloc(4).unwrap().offset;
        assert_eq!(rt.sys_ioctl(0, ioctl::FIONREAD, arg), 0);
        assert_eq!(rt.memory().read_i32(arg).unwrap(), 7);
    }

    #[test]
    fn test_ioctl_on_regular_file() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/f");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        assert_eq!(rt.sys_ioctl(fd, ioctl::TCGETS, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NotTty));
        assert_eq!(rt.sys_ioctl(42, ioctl::TCGETS, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::BadFd));
    }

    #[test]
    fn test_fcntl_commands() {
        let (mut rt, _) = runtime();
        rt.vfs_mut().write_file("/tmp/lock", b"").unwrap();
        let path = cstr(&mut rt, "/tmp/lock");
        let fd = rt.sys_open(path, O_WRONLY, 0);

        assert_eq!(rt.sys_fcntl(fd, fcntl::F_GETFL, 0), O_WRONLY);
        assert_eq!(rt.sys_fcntl(fd, fcntl::F_SETFL, OpenFlags::APPEND.0), 0);
        assert_eq!(
            rt.sys_fcntl(fd, fcntl::F_GETFL, 0),
            O_WRONLY | OpenFlags::APPEND.0
        );

        assert_eq!(rt.sys_fcntl(fd, fcntl::F_DUPFD, 10), 10);
        assert_eq!(rt.sys_fcntl(fd, fcntl::F_DUPFD, -1), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));

        let flock = rt.alloc(32).unwrap().offset;
        assert_eq!(rt.sys_fcntl(fd, fcntl::F_GETLK, flock as i32), 0);
        assert_eq!(rt.memory().read_u16(flock).unwrap(), 2);
        assert_eq!(rt.sys_fcntl(fd, fcntl::F_SETLKW, flock as i32), 0);

        assert_eq!(rt.sys_fcntl(fd, fcntl::F_GETOWN, 0), -1);
        assert_eq!(rt.sys_fcntl(77, fcntl::F_GETFD, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::BadFd));
    }

    #[test]
    fn test_fstat_layout() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/s");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o640);
        let data = bytes(&mut rt, &[7u8; 5000]);
        rt.sys_write(fd, data, 5000);

        let buf = rt.alloc(StatBuf::SIZE as u32).unwrap().offset;
        assert_eq!(rt.sys_fstat(fd, buf), 0);
        assert_eq!(rt.memory().read_u32(buf + 4).unwrap(), 0o100640);
        assert_eq!(rt.memory().read_i64(buf + 24).unwrap(), 5000);
        assert_eq!(rt.memory().read_u32(buf + 32).unwrap(), 4096);
        assert_eq!(rt.memory().read_u32(buf + 36).unwrap(), 2);

        let missing = cstr(&mut rt, "/tmp/none");
        assert_eq!(rt.sys_stat(missing, buf), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NoEntry));
    }

    #[test]
    fn test_stat_follows_links_lstat_does_not() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/dev/stdout");
        let buf = rt.alloc(StatBuf::SIZE as u32).unwrap().offset;

        assert_eq!(rt.sys_stat(path, buf), 0);
        let stat: StatBuf = rt.memory().read_pod(buf).unwrap();
        assert_eq!(stat.rdev, 5 << 8);

        assert_eq!(rt.sys_lstat(path, buf), 0);
        let stat: StatBuf = rt.memory().read_pod(buf).unwrap();
        assert_eq!(stat.mode & 0o170000, 0o120000);

        let empty = cstr(&mut rt, "");
        assert_eq!(rt.sys_newfstatat(1, empty, buf, AT_EMPTY_PATH), 0);
        let stat: StatBuf = rt.memory().read_pod(buf).unwrap();
        assert_eq!(stat.rdev, 5 << 8);
        assert_eq!(rt.sys_newfstatat(AT_FDCWD, path, buf, 0x4000), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));
    }

    #[test]
    fn test_openat_relative_to_directory() {
        let (mut rt, _) = runtime();
        let dir = cstr(&mut rt, "/home/web_user");
        let dirfd = rt.sys_open(dir, OpenFlags::DIRECTORY.0, 0);
        assert!(dirfd >= 3);

        let name = cstr(&mut rt, "model.lp");
        let fd = rt.sys_openat(dirfd, name, O_CREAT | O_WRONLY, 0o644);
        assert!(fd > dirfd);
        assert!(rt.vfs().stat("/home/web_user/model.lp").unwrap().is_file());

        let empty = cstr(&mut rt, "");
        assert_eq!(rt.sys_openat(dirfd, empty, O_RDONLY, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NoEntry));
        assert_eq!(rt.sys_openat(fd, name, O_RDONLY, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NotDir));
    }

    #[test]
    fn test_namespace_calls() {
        let (mut rt, _) = runtime();
        let dir = cstr(&mut rt, "/tmp/d");
        let file = cstr(&mut rt, "/tmp/d/f");
        let moved = cstr(&mut rt, "/tmp/g");
        assert_eq!(rt.sys_mkdir(dir, 0o755), 0);
        assert_eq!(rt.sys_mkdir(dir, 0o755), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Exists));

        let fd = rt.sys_open(file, O_CREAT | O_WRONLY, 0o644);
        rt.sys_close(fd);
        assert_eq!(rt.sys_rmdir(dir), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NotEmpty));

        assert_eq!(rt.sys_rename(file, moved), 0);
        assert_eq!(rt.sys_unlinkat(AT_FDCWD, dir, AT_REMOVEDIR), 0);
        assert_eq!(rt.sys_unlink(moved), 0);
        assert_eq!(rt.sys_unlink(moved), -1);
        assert_eq!(rt.last_errno(), Some(Errno::NoEntry));
    }

    #[test]
    fn test_readlink_truncates_without_terminator() {
        let (mut rt, _) = runtime();
        let target = cstr(&mut rt, "/home/web_user/data");
        let link = cstr(&mut rt, "/tmp/link");
        assert_eq!(rt.sys_symlink(target, link), 0);

        let buf = rt.alloc(32).unwrap().offset;
        rt.memory_mut().fill(buf, 32, 0xff).unwrap();
        assert_eq!(rt.sys_readlink(link, buf, 5), 5);
        assert_eq!(rt.memory().read_bytes(buf, 6).unwrap(), b"/home\xff");
        assert_eq!(rt.sys_readlink(link, buf, 32), 19);
        assert_eq!(rt.sys_readlink(link, buf, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));
    }

    #[test]
    fn test_getcwd_and_chdir() {
        let (mut rt, _) = runtime();
        let home = cstr(&mut rt, "/home/web_user");
        assert_eq!(rt.sys_chdir(home), 0);

        let buf = rt.alloc(64).unwrap().offset;
        assert_eq!(rt.sys_getcwd(buf, 64), 15);
        assert_eq!(rt.memory().read_cstring(buf).unwrap(), "/home/web_user");
        assert_eq!(rt.sys_getcwd(buf, 14), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Range));
        assert_eq!(rt.sys_getcwd(buf, 0), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));
    }

    #[test]
    fn test_truncate_calls() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/t");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        let data = bytes(&mut rt, b"abcdef");
        rt.sys_write(fd, data, 6);

        assert_eq!(rt.sys_ftruncate(fd, 2), 0);
        assert_eq!(rt.vfs().read_file("/tmp/t").unwrap(), b"ab");
        assert_eq!(rt.sys_truncate(path, 0), 0);
        assert_eq!(rt.vfs().stat("/tmp/t").unwrap().size, 0);
        assert_eq!(rt.sys_ftruncate(fd, -1), -1);
        assert_eq!(rt.last_errno(), Some(Errno::Invalid));
    }

    #[test]
    fn test_environment_calls() {
        let (mut rt, _) = runtime();
        let sizes = rt.alloc(8).unwrap().offset;
        assert_eq!(rt.environ_sizes_get(sizes, sizes + 4), 0);
        let count = rt.memory().read_u32(sizes).unwrap();
        let size = rt.memory().read_u32(sizes + 4).unwrap();
        assert_eq!(count as usize, rt.environment().len());

        let environ = rt.alloc(count * 4).unwrap().offset;
        let buf = rt.alloc(size).unwrap().offset;
        assert_eq!(rt.environ_get(environ, buf), 0);

        let first = rt.memory().read_u32(environ).unwrap();
        assert_eq!(first, buf);
        assert_eq!(rt.memory().read_cstring(first).unwrap(), "USER=web_user");
        let last = rt.memory().read_u32(environ + (count - 1) * 4).unwrap();
        assert_eq!(rt.memory().read_cstring(last).unwrap(), "_=./this.program");
    }

    #[test]
    fn test_resize_heap() {
        let (mut rt, _) = runtime();
        let before = rt.memory().len();
        assert_eq!(rt.resize_heap(before + 1), 1);
        assert!(rt.memory().len() > before);
        assert_eq!(rt.resize_heap(MAX_MEMORY + 1), 0);
    }

    #[test]
    fn test_memcpy_big_overlapping() {
        let (mut rt, _) = runtime();
        let at = bytes(&mut rt, b"abcdef");
        rt.memcpy_big(at + 2, at, 4).unwrap();
        assert_eq!(rt.memory().read_bytes(at, 6).unwrap(), b"ababcd");
    }

    #[test]
    fn test_proc_self_fd_tracks_open_descriptors() {
        let (mut rt, _) = runtime();
        let path = cstr(&mut rt, "/tmp/tracked");
        let fd = rt.sys_open(path, O_CREAT | O_RDWR, 0o644);
        let link = format!("/proc/self/fd/{}", fd);
        assert_eq!(rt.vfs().readlink(&link).unwrap(), "/tmp/tracked");
        rt.sys_close(fd);
        assert_eq!(rt.vfs().readlink(&link), Err(Errno::NoEntry));
    }
}

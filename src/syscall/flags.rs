//! Numeric constants of the syscall ABI

pub use crate::vfs::{OpenFlags, Whence};

/// `dirfd` meaning "relative to the working directory"
pub const AT_FDCWD: i32 = -100;

/// `*at` flags
pub const AT_SYMLINK_NOFOLLOW: i32 = 0x100;
pub const AT_REMOVEDIR: i32 = 0x200;
pub const AT_EMPTY_PATH: i32 = 0x1000;

/// Terminal ioctl requests
pub mod ioctl {
    pub const TCGETS: u32 = 0x5401;
    pub const TCSETS: u32 = 0x5402;
    pub const TCSETSW: u32 = 0x5403;
    pub const TCSETSF: u32 = 0x5404;
    pub const TCGETA: u32 = 0x5405;
    pub const TCSETA: u32 = 0x5406;
    pub const TCSETAW: u32 = 0x5407;
    pub const TCSETAF: u32 = 0x5408;
    pub const TIOCGPGRP: u32 = 0x540F;
    pub const TIOCSPGRP: u32 = 0x5410;
    pub const TIOCGWINSZ: u32 = 0x5413;
    pub const TIOCSWINSZ: u32 = 0x5414;
    pub const FIONREAD: u32 = 0x541B;
}

/// `fcntl` commands
pub mod fcntl {
    pub const F_DUPFD: i32 = 0;
    pub const F_GETFD: i32 = 1;
    pub const F_SETFD: i32 = 2;
    pub const F_GETFL: i32 = 3;
    pub const F_SETFL: i32 = 4;
    pub const F_GETLK: i32 = 5;
    pub const F_SETLK: i32 = 6;
    pub const F_SETLKW: i32 = 7;
    pub const F_SETOWN: i32 = 8;
    pub const F_GETOWN: i32 = 9;
    pub const F_GETLK64: i32 = 12;
    pub const F_SETLK64: i32 = 13;
    pub const F_SETLKW64: i32 = 14;
    pub const F_GETOWN_EX: i32 = 16;

    /// `l_type` reported by `F_GETLK`: no conflicting lock
    pub const F_UNLCK: i16 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_libc() {
        assert_eq!(ioctl::TCGETS, 21505);
        assert_eq!(ioctl::TIOCGPGRP, 21519);
        assert_eq!(ioctl::TIOCGWINSZ, 21523);
        assert_eq!(ioctl::FIONREAD, 21531);
    }
}

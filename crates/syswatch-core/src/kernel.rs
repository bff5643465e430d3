//! Kernel constants shared by probes and their configuration.

pub mod errno {
    use std::{fmt, str::FromStr};

    use nix::errno::Errno as NixErrno;
    use thiserror::Error;

    /// Error codes which can be named in configuration files.
    const NAMED: &[NixErrno] = &[
        NixErrno::EPERM,
        NixErrno::ENOENT,
        NixErrno::EINTR,
        NixErrno::EIO,
        NixErrno::EBADF,
        NixErrno::EAGAIN,
        NixErrno::ENOMEM,
        NixErrno::EACCES,
        NixErrno::EFAULT,
        NixErrno::EBUSY,
        NixErrno::EEXIST,
        NixErrno::EXDEV,
        NixErrno::ENOTDIR,
        NixErrno::EISDIR,
        NixErrno::EINVAL,
        NixErrno::ENFILE,
        NixErrno::EMFILE,
        NixErrno::ETXTBSY,
        NixErrno::ENOSPC,
        NixErrno::EROFS,
        NixErrno::ENAMETOOLONG,
        NixErrno::ELOOP,
        NixErrno::ENOTEMPTY,
        NixErrno::EDQUOT,
    ];

    /// Positive errno value, as in `errno.h`. Syscalls return it negated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Errno(pub i32);

    pub const EPERM: Errno = Errno(NixErrno::EPERM as i32);
    pub const ENOENT: Errno = Errno(NixErrno::ENOENT as i32);
    pub const EACCES: Errno = Errno(NixErrno::EACCES as i32);
    pub const EBUSY: Errno = Errno(NixErrno::EBUSY as i32);
    pub const EISDIR: Errno = Errno(NixErrno::EISDIR as i32);

    impl Errno {
        /// The value returned by a failing syscall
        pub fn as_retval(self) -> i64 {
            -(self.0 as i64)
        }
    }

    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("unknown error code {0}")]
    pub struct UnknownErrno(String);

    /// Accepts symbolic names (`EACCES`) or numbers, with or without sign.
    impl FromStr for Errno {
        type Err = UnknownErrno;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if let Ok(value) = s.parse::<i32>() {
                return match value.checked_abs() {
                    Some(value) if value > 0 => Ok(Errno(value)),
                    _ => Err(UnknownErrno(s.to_string())),
                };
            }
            NAMED
                .iter()
                .find(|errno| format!("{errno:?}") == s.to_ascii_uppercase())
                .map(|errno| Errno(*errno as i32))
                .ok_or_else(|| UnknownErrno(s.to_string()))
        }
    }

    impl fmt::Display for Errno {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match NAMED.iter().find(|errno| **errno as i32 == self.0) {
                Some(errno) => write!(f, "{errno:?}"),
                None => write!(f, "{}", self.0),
            }
        }
    }
}

pub mod file {
    /// O_* macros for fcntl/open, x86_64 values
    pub mod flags {
        pub const O_RDONLY: i32 = 0;
        pub const O_WRONLY: i32 = 1;
        pub const O_RDWR: i32 = 2;
        pub const O_CREAT: i32 = 0x40;
        pub const O_EXCL: i32 = 0x80;
        pub const O_TRUNC: i32 = 0x200;
        pub const O_APPEND: i32 = 0x400;
        pub const O_DIRECTORY: i32 = 0x10000;
        pub const O_CLOEXEC: i32 = 0x80000;
    }

    /// unlinkat(2) flags
    pub const AT_REMOVEDIR: i32 = 0x200;
}

pub mod fs {
    /// `s_magic` of an overlayfs superblock
    pub const OVERLAYFS_SUPER_MAGIC: u64 = 0x794c_7630;
}

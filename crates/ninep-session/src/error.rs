//! 9P error representations.
//!
//! In 9P2000 errors travel to the client as strings inside `Rerror`.
//! The strings in [`string`] follow the wording of `net/9p/error.c` in the
//! Linux kernel, so v9fs clients map them back to the right errno.

use std::io::ErrorKind::*;
use std::{error as stderror, fmt, io};

use crate::error::errno::*;

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    e.raw_os_error()
        .map(nix::errno::Errno::from_raw)
        .unwrap_or(match e.kind() {
            NotFound => ENOENT,
            PermissionDenied => EPERM,
            ConnectionRefused => ECONNREFUSED,
            ConnectionReset => ECONNRESET,
            ConnectionAborted => ECONNABORTED,
            NotConnected => ENOTCONN,
            AddrInUse => EADDRINUSE,
            AddrNotAvailable => EADDRNOTAVAIL,
            BrokenPipe => EPIPE,
            AlreadyExists => EEXIST,
            WouldBlock => EAGAIN,
            InvalidInput => EINVAL,
            InvalidData => EINVAL,
            TimedOut => ETIMEDOUT,
            WriteZero => EAGAIN,
            Interrupted => EINTR,
            _ => EIO,
        })
}

/// 9P error type which is convertible to an errno.
///
/// `Display` yields the text sent to clients in `Rerror`.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno.
    No(nix::errno::Errno),
    /// I/O error.
    Io(io::Error),
}

impl Error {
    /// Get an errno representation.
    pub fn errno(&self) -> nix::errno::Errno {
        match *self {
            Error::No(ref e) => *e,
            Error::Io(ref e) => errno_from_ioerror(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref e) => write!(f, "{}", string::from_errno(*e)),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::No(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

/// Text for an `Rerror` caused by `e`.
///
/// OS errors use the 9P wording; anything else keeps its own message.
pub fn ename(e: &io::Error) -> String {
    match e.raw_os_error() {
        Some(n) => string::from_errno(nix::errno::Errno::from_raw(n)).to_owned(),
        None => e.to_string(),
    }
}

/// System error numbers.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P error strings imported from Linux.
pub mod string {
    use nix::errno::Errno;

    pub const EPERM: &str = "Operation not permitted";
    pub const ENOENT: &str = "No such file or directory";
    pub const EIO: &str = "Input/output error";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EACCES: &str = "Permission denied";
    pub const EEXIST: &str = "File exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const EROFS: &str = "Read-only file system";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const EPROTO: &str = "Protocol error";
    pub const EOPNOTSUPP: &str = "Operation not supported";
    pub const EINTR: &str = "Interrupted system call";

    /// Pick the 9P wording for `e`, falling back to the libc description.
    pub fn from_errno(e: Errno) -> &'static str {
        match e {
            Errno::EPERM => EPERM,
            Errno::ENOENT => ENOENT,
            Errno::EIO => EIO,
            Errno::EBADF => EBADF,
            Errno::EACCES => EACCES,
            Errno::EEXIST => EEXIST,
            Errno::ENOTDIR => ENOTDIR,
            Errno::EISDIR => EISDIR,
            Errno::EINVAL => EINVAL,
            Errno::EROFS => EROFS,
            Errno::ENOTEMPTY => ENOTEMPTY,
            Errno::EPROTO => EPROTO,
            Errno::EOPNOTSUPP => EOPNOTSUPP,
            Errno::EINTR => EINTR,
            e => e.desc(),
        }
    }
}

//! 9P2000 error representations.
//!
//! In 9P2000, errors are plain strings (`Rerror.ename`), unlike the errno
//! model 9P2000.L added later. This module classifies the *kinds* of
//! error the core distinguishes (§7) and renders the text that is allowed
//! to reach the client.

use thiserror::Error;

/// An error kind the core can raise while servicing a connection.
///
/// `Display` renders the text that is safe to put on the wire in an
/// `Rerror`; transport and auth failures are deliberately rendered with a
/// fixed generic message instead of their underlying `Display` output, so
/// that OS-level detail (paths, peer addresses, policy internals) never
/// reaches a remote client.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed message: bad type, out-of-range size, invalid UTF-8,
    /// an oversized name, or too many walk elements. The connection stays
    /// open; only this one request is refused.
    #[error("{0}")]
    Framing(String),

    /// The underlying byte stream failed. Fatal for the connection.
    #[error("transport error")]
    Transport(#[from] std::io::Error),

    /// A protocol-level violation: out-of-order `Tversion`, unknown fid,
    /// duplicate fid/tag, a file not open for I/O, walking an already-open
    /// fid, creating on a non-directory, and similar.
    #[error("{0}")]
    Protocol(String),

    /// User handler code declined a request or never answered it.
    #[error("{0}")]
    Handler(String),

    /// The configured `AuthPolicy` rejected an attach.
    #[error("auth failed")]
    Auth,

    /// A single message would exceed the protocol's 2^32-1 byte limit.
    /// Treated as a programming error: the connection is aborted.
    #[error("payload too large")]
    PayloadTooLarge,

    /// A filename exceeds [`crate::fcall::MAX_FILENAME_LEN`] and cannot be
    /// silently truncated the way version/uname/aname/error strings can.
    #[error("name too long")]
    NameTooLong,
}

impl Error {
    /// The sanitized string sent to the client as `Rerror.ename`.
    ///
    /// Framing, protocol, and handler errors carry client-safe text
    /// already (drawn from [`string`] or built by the caller from
    /// protocol constants); transport and auth errors are replaced with a
    /// fixed phrase so no internal detail leaks.
    pub fn client_message(&self) -> String {
        match self {
            Error::Framing(s) | Error::Protocol(s) | Error::Handler(s) => s.clone(),
            Error::Transport(_) => string::EIO.to_owned(),
            Error::Auth => "auth failed".to_owned(),
            Error::PayloadTooLarge => "message too large".to_owned(),
            Error::NameTooLong => string::ENAMETOOLONG.to_owned(),
        }
    }

    /// Shorthand for a [`Error::Protocol`] built from a `&str`.
    pub fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    /// Shorthand for a [`Error::Framing`] built from a `&str`.
    pub fn framing(msg: impl Into<String>) -> Error {
        Error::Framing(msg.into())
    }

    /// Shorthand for a [`Error::Handler`] built from a `&str`.
    pub fn handler(msg: impl Into<String>) -> Error {
        Error::Handler(msg.into())
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Canonical 9P2000 error strings, imported from `include/net/9p/error.c`
/// of the Linux kernel (the standard table every 9P2000 server quotes
/// verbatim so v9fs clients can pattern-match on them).
pub mod string {
    pub const EPERM: &str = "Operation not permitted";
    pub const EPERM_WSTAT: &str = "wstat prohibited";
    pub const ENOENT: &str = "No such file or directory";
    pub const ENOENT_DIR: &str = "directory entry not found";
    pub const ENOENT_FILE: &str = "file not found";
    pub const EIO: &str = "Input/output error";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EACCES: &str = "Permission denied";
    pub const EEXIST: &str = "File exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const ENAMETOOLONG: &str = "File name too long";
    pub const ENOSYS: &str = "Function not implemented";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const EPROTO: &str = "Protocol error";
    pub const EOPNOTSUPP: &str = "Operation not supported";
    pub const ECONNREFUSED_AUTH: &str = "authentication failed";
    pub const EBADF_FID: &str = "fid unknown or out of range";
    pub const EBADF_INUSE: &str = "fid already in use";
    pub const EPERM_CONV: &str = "wstat can't convert between files and directories";
    pub const EINVAL_MODE: &str = "illegal mode";
    pub const EINVAL_NAME: &str = "illegal name";
    pub const EPROTO_WSTAT: &str = "bogus wstat buffer";
    pub const EAGAIN_EXCL: &str = "exclusive use file already open";
    pub const EPERM_RMROOT: &str = "cannot remove root";
    pub const ENOSYS_SYNC: &str = "not supported";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_never_leak_io_detail() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "/secret/path missing");
        let err = Error::Transport(io);
        assert_eq!(err.client_message(), string::EIO);
        assert!(!err.client_message().contains("secret"));
    }

    #[test]
    fn framing_error_passes_its_message_through() {
        let err = Error::framing(string::EPROTO);
        assert_eq!(err.client_message(), string::EPROTO);
    }
}

//! Error taxonomy: transport, protocol, timeout, control-line death, server-reported failures.

use std::io;

pub type Result<T> = std::result::Result<T, DcapError>;

/// Coarse classification of a failure, for callers that only care which stage broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolve,
    Socket,
    Connect,
    Bind,
    Hello,
    Config,
    Protocol,
    Timeout,
    ControlLine,
    Server,
    Usage,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum DcapError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("callback socket bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("hello to {door} failed: {reason}")]
    Hello { door: String, reason: String },
    #[error("no doors available")]
    NoDoors,
    #[error("configuration: {0}")]
    Config(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("mover refused {command} (rc={result}): {message}")]
    Refused {
        command: &'static str,
        result: i32,
        message: String,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("control line to {0} is down")]
    ControlLineDown(String),
    #[error("server failure {code}: {message}")]
    Server {
        code: i32,
        message: String,
        errno: i32,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("name {0:?} cannot be carried on the control line")]
    InvalidName(String),
    #[error("invalid open flags")]
    Flags,
    #[error("bad file descriptor {0}")]
    BadFd(i32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("giving up after {attempts} recovery attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DcapError>,
    },
    #[error("cannot re-establish the data channel: {0}")]
    RecoveryFailed(#[source] Box<DcapError>),
    #[error("session failed earlier and must be closed")]
    SessionFailed,
}

impl DcapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DcapError::Resolve(_) => ErrorKind::Resolve,
            DcapError::Socket(_) => ErrorKind::Socket,
            DcapError::Connect { .. } | DcapError::NoDoors => ErrorKind::Connect,
            DcapError::Bind(_) => ErrorKind::Bind,
            DcapError::Hello { .. } => ErrorKind::Hello,
            DcapError::Config(_) => ErrorKind::Config,
            DcapError::Protocol(_) | DcapError::Refused { .. } => ErrorKind::Protocol,
            DcapError::Timeout(_) => ErrorKind::Timeout,
            DcapError::ControlLineDown(_) => ErrorKind::ControlLine,
            DcapError::Server { .. } => ErrorKind::Server,
            DcapError::InvalidName(_)
            | DcapError::Flags
            | DcapError::BadFd(_)
            | DcapError::InvalidArgument(_) => ErrorKind::Usage,
            DcapError::Io(_)
            | DcapError::RetriesExhausted { .. }
            | DcapError::RecoveryFailed(_)
            | DcapError::SessionFailed => ErrorKind::Io,
        }
    }

    /// POSIX errno equivalent, for hosts that expose a C-style interface.
    pub fn errno(&self) -> i32 {
        match self {
            DcapError::Server { errno, .. } => *errno,
            DcapError::InvalidName(_) | DcapError::Flags | DcapError::InvalidArgument(_) => {
                libc::EINVAL
            }
            DcapError::BadFd(_) => libc::EBADF,
            DcapError::Timeout(_) => libc::ETIMEDOUT,
            DcapError::Connect { .. } | DcapError::NoDoors => libc::ECONNREFUSED,
            DcapError::Resolve(_) => libc::EHOSTUNREACH,
            DcapError::Bind(_) => libc::EADDRINUSE,
            _ => libc::EIO,
        }
    }

    /// Whether a failure during data-channel I/O may be cured by reconnecting.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DcapError::Io(_)
                | DcapError::Timeout(_)
                | DcapError::Protocol(_)
                | DcapError::Refused { .. }
                | DcapError::ControlLineDown(_)
        )
    }
}

/// Map a symbolic error name sent by the door (`ENOENT`, ...) to the local errno.
pub fn errno_from_name(name: &str) -> i32 {
    match name {
        "EPERM" => libc::EPERM,
        "ENOENT" => libc::ENOENT,
        "EIO" => libc::EIO,
        "EBADF" => libc::EBADF,
        "EAGAIN" => libc::EAGAIN,
        "ENOMEM" => libc::ENOMEM,
        "EACCES" => libc::EACCES,
        "EBUSY" => libc::EBUSY,
        "EEXIST" => libc::EEXIST,
        "ENOTDIR" => libc::ENOTDIR,
        "EISDIR" => libc::EISDIR,
        "EINVAL" => libc::EINVAL,
        "EFBIG" => libc::EFBIG,
        "ENOSPC" => libc::ENOSPC,
        "EROFS" => libc::EROFS,
        "ENAMETOOLONG" => libc::ENAMETOOLONG,
        "ENOTEMPTY" => libc::ENOTEMPTY,
        "ETIMEDOUT" => libc::ETIMEDOUT,
        "ENOTSUP" => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

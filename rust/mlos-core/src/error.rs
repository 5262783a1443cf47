//! Error taxonomy for the fabric.

use std::fmt;
use std::io;

/// Errors surfaced by region bootstrap, allocation, and lookup paths.
///
/// Channel send/receive never use this type for termination: a write to a
/// terminated channel reports [`crate::channel::SendStatus::Terminated`]
/// and a read returns promptly, because termination is an expected
/// shutdown signal rather than a failure.
#[derive(Debug)]
pub enum Error {
    /// A shared-memory object or semaphore with this name already exists.
    AlreadyExists,
    /// The named object, or the looked-up config record, does not exist.
    NotFound,
    /// OS-level permissions rejected the handle.
    PermissionDenied,
    /// The arena (or the dictionary slot array) is exhausted.
    OutOfMemory,
    /// Socket, inotify, mmap, or truncate failure.
    Io(io::Error),
    /// A reader saw a frame with an out-of-range type index, a hash
    /// mismatch, or failed variable-length verification.
    InvalidFrame,
    /// The channel's terminate flag was observed.
    ChannelTerminated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyExists => write!(f, "object already exists"),
            Error::NotFound => write!(f, "object not found"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::OutOfMemory => write!(f, "shared region out of memory"),
            Error::Io(err) => write!(f, "I/O failure: {err}"),
            Error::InvalidFrame => write!(f, "invalid frame"),
            Error::ChannelTerminated => write!(f, "channel terminated"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AlreadyExists => Error::AlreadyExists,
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::Io(err),
        }
    }
}

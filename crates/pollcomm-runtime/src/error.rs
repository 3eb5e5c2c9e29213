//! Error types for the reactor and its connections

use nix::errno::Errno;
use pollcomm_core::error::MessageError;
use thiserror::Error;

/// Result type for reactor and connection operations
pub type CommResult<T> = Result<T, CommError>;

/// Errors that can occur while building or running connections
#[derive(Debug, Error)]
pub enum CommError {
    /// A priority, delay, date or limit is out of range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The signal is invalid, uncatchable or already registered
    #[error("signal {signo}: {reason}")]
    Signal { signo: i32, reason: &'static str },

    /// A system call failed
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// The connection is already part of the reactor
    #[error("connection {0:?} is already added")]
    AlreadyAdded(String),

    /// The connection has no usable descriptor (or is busy)
    #[error("connection {0:?} cannot be added")]
    InvalidConnection(String),

    /// No descriptor to wait on and no timeout pending
    #[error("nothing left to wait for")]
    Exhausted,

    /// The readiness wait failed for a reason other than an interrupt
    #[error("poll failed: {0}")]
    Poll(Errno),

    /// A blocking exchange ran out of time
    #[error("{0}: timed out")]
    Timeout(String),

    /// The peer closed its end
    #[error("{0}: peer hung up")]
    Hangup(String),

    /// The descriptor became invalid
    #[error("{0}: invalid socket")]
    InvalidSocket(String),

    /// The descriptor reported an error condition
    #[error("{0}: socket error")]
    SocketError(String),

    /// A datagram exceeds the configured ceiling
    #[error("message of {size} bytes exceeds the {max} byte datagram limit")]
    MessageTooLarge { size: usize, max: usize },

    /// Message codec failure
    #[error(transparent)]
    Message(#[from] MessageError),

    /// I/O error from a std socket
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Feature not available on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl CommError {
    /// Build an `Os` error from the current `errno`.
    #[inline]
    pub fn os(op: &'static str) -> Self {
        CommError::Os {
            op,
            errno: Errno::last(),
        }
    }
}

impl From<Errno> for CommError {
    fn from(errno: Errno) -> Self {
        CommError::Os { op: "syscall", errno }
    }
}

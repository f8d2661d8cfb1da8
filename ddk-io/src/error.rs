//! Error types for ddk-io
//!
//! Two kinds of failure flow through the crate:
//!
//! - [`Error`] is returned from synchronous calls (publishing devices, binding
//!   drivers, loading bind programs, configuring the host).
//! - [`Status`] is the outcome carried by a transaction's single completion.
//!   Transaction failures are never returned on the issuer's stack.

use crate::binding::BindProgramError;
use crate::device::DeviceId;

/// Result type for ddk-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ddk-io operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bind program failed load-time validation
    #[error("invalid bind program: {0}")]
    BindProgram(#[from] BindProgramError),

    /// Device id does not name a live device
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// No driver registered under this name
    #[error("driver not found: {0}")]
    DriverNotFound(String),

    /// Operation is not valid in the device's current state
    #[error("bad state: {0}")]
    BadState(String),

    /// Device already has a driver bound
    #[error("device {0} already has a driver bound")]
    AlreadyBound(DeviceId),

    /// Invalid argument provided
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device does not implement the requested operation
    #[error("operation not supported")]
    NotSupported,

    /// Device or capability went away underneath the caller
    #[error("peer closed")]
    PeerClosed,

    /// No driver's bind program matched the device
    #[error("no driver matched device {0}")]
    NoMatch(DeviceId),

    /// Operation was cancelled before it produced a result
    #[error("operation cancelled")]
    Cancelled,

    /// A worker or interrupt thread panicked
    #[error("thread panicked")]
    ThreadPanic,

    /// Host configuration was rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON host configuration failed to parse
    #[error("malformed host configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported as a raw status by a driver hook
    #[error("status: {0}")]
    Status(Status),
}

impl Error {
    /// Map this error onto the closest transaction status.
    ///
    /// The coordinator reports bind rejections to its caller as status codes.
    pub fn status(&self) -> Status {
        match self {
            Error::BindProgram(_) | Error::InvalidArgument(_) | Error::Config(_) => {
                Status::InvalidArgs
            }
            Error::Json(_) => Status::InvalidArgs,
            Error::DeviceNotFound(_) | Error::DriverNotFound(_) | Error::NoMatch(_) => {
                Status::NotFound
            }
            Error::BadState(_) => Status::BadState,
            Error::AlreadyBound(_) => Status::AlreadyBound,
            Error::NotSupported => Status::NotSupported,
            Error::PeerClosed => Status::PeerClosed,
            Error::Cancelled => Status::Canceled,
            Error::ThreadPanic => Status::Internal,
            Error::Io(_) => Status::Io,
            Error::Status(status) => *status,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status {
            Status::NotSupported => Error::NotSupported,
            Status::PeerClosed => Error::PeerClosed,
            Status::Canceled => Error::Cancelled,
            other => Error::Status(other),
        }
    }
}

/// Outcome of a transaction or driver hook.
///
/// Codes follow the negative-errno convention used by the host kernel
/// interface, so they can cross a process boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Internal,
    NotSupported,
    NoResources,
    NoMemory,
    InvalidArgs,
    OutOfRange,
    BufferTooSmall,
    BadState,
    TimedOut,
    Canceled,
    PeerClosed,
    NotFound,
    AlreadyBound,
    Unavailable,
    Io,
    IoRefused,
    IoNotPresent,
}

impl Status {
    /// Raw status code.
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Internal => -1,
            Status::NotSupported => -2,
            Status::NoResources => -3,
            Status::NoMemory => -4,
            Status::InvalidArgs => -10,
            Status::OutOfRange => -14,
            Status::BufferTooSmall => -15,
            Status::BadState => -20,
            Status::TimedOut => -21,
            Status::Canceled => -23,
            Status::PeerClosed => -24,
            Status::NotFound => -25,
            Status::AlreadyBound => -27,
            Status::Unavailable => -28,
            Status::Io => -40,
            Status::IoRefused => -41,
            Status::IoNotPresent => -44,
        }
    }

    /// Decode a raw status code. Unknown codes map to [`Status::Internal`].
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            -2 => Status::NotSupported,
            -3 => Status::NoResources,
            -4 => Status::NoMemory,
            -10 => Status::InvalidArgs,
            -14 => Status::OutOfRange,
            -15 => Status::BufferTooSmall,
            -20 => Status::BadState,
            -21 => Status::TimedOut,
            -23 => Status::Canceled,
            -24 => Status::PeerClosed,
            -25 => Status::NotFound,
            -27 => Status::AlreadyBound,
            -28 => Status::Unavailable,
            -40 => Status::Io,
            -41 => Status::IoRefused,
            -44 => Status::IoNotPresent,
            _ => Status::Internal,
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Convert into a `Result`, mapping every non-`Ok` status to an [`Error`].
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() { Ok(()) } else { Err(self.into()) }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            Status::Ok,
            Status::NotSupported,
            Status::BadState,
            Status::PeerClosed,
            Status::IoNotPresent,
            Status::TimedOut,
        ] {
            assert_eq!(Status::from_code(status.code()), status);
        }
        assert_eq!(Status::from_code(-9999), Status::Internal);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(Error::NotSupported.status(), Status::NotSupported);
        assert_eq!(Error::from(Status::PeerClosed).status(), Status::PeerClosed);
        assert_eq!(Error::from(Status::Io).status(), Status::Io);
        assert!(Status::Ok.into_result().is_ok());
        assert!(matches!(
            Status::NotSupported.into_result(),
            Err(Error::NotSupported)
        ));
    }
}

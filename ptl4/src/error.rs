//! Error types for the message engine.
//!
//! The variants mirror the stable public return-code set; everything a
//! caller can observe synchronously maps onto one of these.

use std::fmt;
use std::io;

/// Engine error / return code.
#[derive(Debug)]
pub enum Error {
    /// Generic failure.
    Fail,
    /// An argument failed validation (stale handle, bad length, ...).
    ArgInvalid,
    /// The library or interface is not initialised.
    NoInit,
    /// A resource pool or table is exhausted.
    NoSpace,
    /// The object is still in use and cannot be freed.
    InUse,
    /// The requested process id is already taken on this fabric.
    PidInUse,
    /// The event queue holds no events.
    EqEmpty,
    /// At least one event was dropped since the last read.
    EqDropped,
    /// No counting event in the set reached its threshold in time.
    CtNoneReached,
    /// A blocking call was interrupted by interface shutdown.
    Interrupted,
    /// IO error from the underlying transport or segment layer.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fail => write!(f, "operation failed"),
            Error::ArgInvalid => write!(f, "invalid argument"),
            Error::NoInit => write!(f, "not initialised"),
            Error::NoSpace => write!(f, "out of resources"),
            Error::InUse => write!(f, "object in use"),
            Error::PidInUse => write!(f, "pid already in use"),
            Error::EqEmpty => write!(f, "event queue empty"),
            Error::EqDropped => write!(f, "event queue dropped events"),
            Error::CtNoneReached => write!(f, "no counting event reached its threshold"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

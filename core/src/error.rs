use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Boxed cause carried by [`BackendError::TransportFailure`].
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of a [`BackendError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    AdapterUnavailable,
    TransportFailure,
    ProtocolError,
    Timeout,
    Decode,
}

/// Error type shared by every bluetooth backend.
///
/// Transport specific failures (io, signals, D-Bus, dongle result codes) are
/// converted into one of these variants before they leave a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not connected to any device")]
    NotConnected,

    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("transport failure: {message}")]
    TransportFailure {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("{operation} timed out after {attempts} attempt(s)")]
    Timeout { operation: String, attempts: u32 },

    #[error("could not decode payload: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotConnected => ErrorKind::NotConnected,
            BackendError::AdapterUnavailable(_) => ErrorKind::AdapterUnavailable,
            BackendError::TransportFailure { .. } => ErrorKind::TransportFailure,
            BackendError::ProtocolError(_) => ErrorKind::ProtocolError,
            BackendError::Timeout { .. } => ErrorKind::Timeout,
            BackendError::Decode(_) => ErrorKind::Decode,
        }
    }

    /// Failure without an underlying cause.
    pub fn failure(message: impl Into<String>) -> Self {
        BackendError::TransportFailure {
            message: message.into(),
            source: None,
        }
    }

    /// Failure wrapping the error that produced it.
    pub fn wrap<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: Into<Cause>,
    {
        BackendError::TransportFailure {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        BackendError::Timeout {
            operation: operation.into(),
            attempts,
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                BackendError::AdapterUnavailable(err.to_string())
            }
            io::ErrorKind::TimedOut => BackendError::timeout("io", 1),
            _ => BackendError::wrap("i/o error", err),
        }
    }
}

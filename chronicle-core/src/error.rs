//! Error types for chronicle-core

use std::time::Duration;

use thiserror::Error;

/// Why a link to a backend could not be established or kept.
///
/// Transport layers classify failures into one of these kinds when the
/// error is created, so callers never inspect message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// The backend could not be reached at all (DNS, refused, reset, TLS)
    Unreachable,
    /// The backend answered with a non-success HTTP status
    Status(u16),
    /// The backend answered with something we could not understand
    Protocol,
    /// The link closed underneath us
    Closed,
    /// The attempt was cancelled by `disconnect()` or `retry()`
    Cancelled,
}

/// Main error type for the chronicle-core library
///
/// `Clone` so that one in-flight connection attempt can hand the same
/// failure to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Network or protocol failure establishing or maintaining a link
    #[error("connection error: {message}")]
    Connection {
        kind: ConnectionFailure,
        message: String,
    },

    /// Request exceeded its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials were rejected by the backend
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed filter or input
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(String),
}

impl Error {
    pub fn connection(kind: ConnectionFailure, message: impl Into<String>) -> Self {
        Error::Connection {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::connection(ConnectionFailure::Unreachable, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::connection(ConnectionFailure::Protocol, message)
    }

    pub fn cancelled() -> Self {
        Self::connection(ConnectionFailure::Cancelled, "connection attempt cancelled")
    }

    /// HTTP status carried by the error, if the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Connection {
                kind: ConnectionFailure::Status(code),
                ..
            } => Some(*code),
            _ => None,
        }
    }

    /// True for failures that retrying will not fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::Validation(_) | Error::Config(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

/// Result type alias for chronicle-core
pub type Result<T> = std::result::Result<T, Error>;

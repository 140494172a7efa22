//! Common error types for offsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a backend rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCategory {
    /// 401: credentials missing or expired.
    Unauthorized,
    /// 403: authenticated but not allowed.
    Forbidden,
    /// 404: the addressed entity does not exist.
    NotFound,
    /// 409: the write collided with a newer server state.
    Conflict,
    /// Any other 4xx.
    ClientError(u16),
    /// Any 5xx.
    ServerError(u16),
}

impl StatusCategory {
    /// Classify an HTTP status code. Returns `None` for non-error codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            409 => Some(Self::Conflict),
            400..=499 => Some(Self::ClientError(status)),
            500..=599 => Some(Self::ServerError(status)),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::NotFound => write!(f, "not found"),
            Self::Conflict => write!(f, "conflict"),
            Self::ClientError(code) => write!(f, "client error {}", code),
            Self::ServerError(code) => write!(f, "server error {}", code),
        }
    }
}

/// Top-level error type for offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend could not be reached (offline, DNS, timeout, reset).
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The backend answered but refused the request.
    #[error("Server rejected request ({status}): {message}")]
    ServerRejected {
        /// Status classification.
        status: StatusCategory,
        /// Server-provided description.
        message: String,
    },

    /// A LocalOnly read required a record the cache does not hold.
    #[error("Not found locally: {0}")]
    NotFoundLocally(String),

    /// Cached bytes could not be decoded; the collection cache is unusable.
    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    /// The request was cancelled by its owner.
    #[error("Request cancelled")]
    Cancelled,

    /// A replayed write collided with a newer server state.
    #[error("Conflict on replay: {0}")]
    ConflictOnReplay(String),

    /// Pending operations must be pushed (or purged) first.
    #[error("{0} pending operations must be pushed or purged first")]
    PendingOperations(usize),

    /// Durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Build the error for an HTTP status, if the status is an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        let category = StatusCategory::from_status(status)?;
        let message = message.into();
        Some(match category {
            StatusCategory::NotFound => Error::NotFound(message),
            status => Error::ServerRejected { status, message },
        })
    }

    /// Whether a durable store failure may succeed when tried again.
    ///
    /// Corruption is never transient.
    pub fn is_transient_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Storage(_))
    }

    /// Whether the error came from the network layer.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::NetworkUnreachable(_) | Error::ServerRejected { .. } | Error::NotFound(_)
        )
    }

    /// Whether this is a replay conflict, either classified or as a raw 409.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::ConflictOnReplay(_)
                | Error::ServerRejected {
                    status: StatusCategory::Conflict,
                    ..
                }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(StatusCategory::from_status(201), None);
        assert_eq!(StatusCategory::from_status(409), Some(StatusCategory::Conflict));
        assert_eq!(
            StatusCategory::from_status(422),
            Some(StatusCategory::ClientError(422))
        );
        assert_eq!(
            StatusCategory::from_status(503),
            Some(StatusCategory::ServerError(503))
        );
    }

    #[test]
    fn test_from_status() {
        assert!(Error::from_status(200, "ok").is_none());
        assert!(matches!(Error::from_status(404, "gone"), Some(Error::NotFound(_))));
        assert!(Error::from_status(409, "stale").unwrap().is_conflict());
    }

    #[test]
    fn test_transient_io() {
        assert!(Error::Storage("busy".into()).is_transient_io());
        assert!(!Error::StorageCorrupt("bad bytes".into()).is_transient_io());
        assert!(!Error::Cancelled.is_transient_io());
    }
}

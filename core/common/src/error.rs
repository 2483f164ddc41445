//! Common error types for the OcuScan sync engine.

use thiserror::Error;

/// Top-level error type for store, mirror and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A local uniqueness or foreign-key constraint was violated.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The local store failed or is unavailable.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The remote backend could not be reached.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote backend refused the payload.
    #[error("Remote rejected: {0}")]
    RemoteRejected(String),

    /// The remote backend requires an authenticated session.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error originated at the remote mirror boundary.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable(_) | Error::RemoteRejected(_) | Error::AuthRequired(_)
        )
    }

    /// Whether a later run may succeed without any change to the record.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_classification() {
        assert!(Error::RemoteUnavailable("down".into()).is_remote());
        assert!(Error::AuthRequired("no session".into()).is_remote());
        assert!(!Error::Storage("closed".into()).is_remote());

        assert!(Error::RemoteUnavailable("down".into()).is_transient());
        assert!(!Error::RemoteRejected("bad payload".into()).is_transient());
    }
}

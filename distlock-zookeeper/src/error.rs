//! Ensemble error types.

use distlock_core::LockError;
use thiserror::Error;

/// Result type for ensemble operations.
pub type EnsembleResult<T> = std::result::Result<T, EnsembleError>;

/// Failures reported by an [`EnsembleSession`](crate::EnsembleSession).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnsembleError {
    /// The node (or its parent, for creates) does not exist.
    #[error("Node does not exist: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// The node still has children.
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes cannot have children.
    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// Version precondition failed.
    #[error("Version mismatch for {0}")]
    BadVersion(String),

    /// The path is malformed.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The connection to the ensemble dropped.
    #[error("Connection to the ensemble was lost")]
    ConnectionLoss,

    /// The session expired or was closed.
    #[error("Session expired")]
    SessionExpired,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Connecting took longer than the connect timeout.
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// Any other failure.
    #[error("Ensemble error: {0}")]
    Other(String),
}

impl EnsembleError {
    /// Check if this error indicates the session is unusable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::SessionExpired | Self::ConnectTimeout(_)
        )
    }
}

impl From<EnsembleError> for LockError {
    fn from(err: EnsembleError) -> Self {
        match err {
            EnsembleError::InvalidPath(path) => LockError::InvalidName(path),
            EnsembleError::AuthFailed(msg) => LockError::Config(format!("authentication failed: {}", msg)),
            e if e.is_connection_loss() => LockError::ConnectionLost(e.to_string()),
            e => LockError::backend(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_maps_to_retryable() {
        let err: LockError = EnsembleError::SessionExpired.into();
        assert!(matches!(err, LockError::ConnectionLost(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_errors_are_backend() {
        let err: LockError = EnsembleError::NotEmpty("/locks".into()).into();
        assert!(matches!(err, LockError::Backend(_)));
        let err: LockError = EnsembleError::InvalidPath("//".into()).into();
        assert!(matches!(err, LockError::InvalidName(_)));
    }
}

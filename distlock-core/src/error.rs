//! Lock error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Distributed lock errors.
///
/// Contention is never an error: a busy lock is reported as `Ok(None)` by the
/// `try_acquire*` family. Backends translate their native failures into these
/// variants before anything reaches the acquisition engine.
#[derive(Debug, Error)]
pub enum LockError {
    /// The overall acquisition timeout elapsed.
    #[error("Timed out acquiring lock '{name}' after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The caller's cancellation token fired.
    #[error("Lock acquisition was cancelled")]
    Cancelled,

    /// The lock name cannot be mapped to a backend name.
    #[error("Invalid lock name: {0}")]
    InvalidName(String),

    /// Invalid configuration or connection parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing artifact was destroyed while acquiring.
    #[error("Lock lost: {0}")]
    Lost(String),

    /// The backend connection or session was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A transient condition persisted past its retry budget.
    #[error("Retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// Unrecoverable backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    /// Create a timeout error for the named lock.
    pub fn timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            name: name.into(),
            timeout,
        }
    }

    /// Create a backend error from any displayable cause.
    pub fn backend(cause: impl std::fmt::Display) -> Self {
        Self::Backend(cause.to_string())
    }

    /// Check if this error is transient.
    ///
    /// Only a dropped backend connection qualifies. A timeout means the lock
    /// was held by someone else for the whole wait.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }

    /// Check if this error came from the caller's cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio::task::JoinError> for LockError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Backend(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = LockError::timeout("orders", Duration::from_secs(5));
        let display = err.to_string();
        assert!(display.contains("orders"));
        assert!(display.contains("5s"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LockError::ConnectionLost("expired".into()).is_retryable());
        assert!(!LockError::Cancelled.is_retryable());
        assert!(!LockError::timeout("orders", Duration::from_secs(1)).is_retryable());
        assert!(!LockError::InvalidName("".into()).is_retryable());
        assert!(LockError::Cancelled.is_cancelled());
    }
}

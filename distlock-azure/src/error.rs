//! Blob store error types.

use distlock_core::LockError;
use thiserror::Error;

/// Result type for blob store operations.
pub type BlobStoreResult<T> = std::result::Result<T, BlobStoreError>;

/// Failures reported by a [`BlobStore`](crate::BlobStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobStoreError {
    /// Another lease is active on the blob.
    #[error("There is already a lease present")]
    LeaseAlreadyPresent,

    /// The blob does not exist.
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// The blob already exists.
    #[error("Blob already exists: {0}")]
    BlobAlreadyExists(String),

    /// A conditional request precondition failed.
    #[error("Condition not met")]
    ConditionNotMet,

    /// The lease id does not match the active lease.
    #[error("Lease id mismatch")]
    LeaseIdMismatch,

    /// No lease is active on the blob.
    #[error("No lease is present on the blob")]
    LeaseNotPresent,

    /// The blob is leased and the request carried no lease id.
    #[error("Lease id missing")]
    LeaseIdMissing,

    /// Any other store failure.
    #[error("Blob store error: {0}")]
    Other(String),
}

impl BlobStoreError {
    /// Whether the error means a lease this process held is gone.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Self::LeaseIdMismatch | Self::LeaseNotPresent | Self::BlobNotFound(_)
        )
    }

    /// Whether the error means someone else currently holds the blob.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::LeaseAlreadyPresent | Self::LeaseIdMissing | Self::ConditionNotMet
        )
    }
}

impl From<BlobStoreError> for LockError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::Other(msg) => LockError::Backend(msg),
            other => LockError::backend(other),
        }
    }
}

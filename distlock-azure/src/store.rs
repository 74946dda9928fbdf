//! Blob store boundary.
//!
//! The lock algorithm only needs a handful of lease and metadata calls, so
//! the store is a small trait. [`InMemoryBlobStore`](crate::InMemoryBlobStore)
//! implements it in-process; `AzureBlobStore` (feature `azure`) implements it
//! over Azure Blob Storage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::BlobStoreResult;

/// Blob metadata (user-defined key/value pairs).
pub type BlobMetadata = HashMap<String, String>;

/// Metadata key marking a blob created on demand by a lock.
pub const CREATED_MARKER_KEY: &str = "distlockcreated";

/// Shortest finite lease the store accepts.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Longest finite lease the store accepts.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Longest blob name the store accepts.
pub const MAX_BLOB_NAME_LEN: usize = 1024;

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Blob name.
    pub name: String,
    /// Blob metadata.
    pub metadata: BlobMetadata,
    /// Whether a lease is currently active.
    pub leased: bool,
}

impl BlobInfo {
    /// Creation time recorded by the lock marker, in epoch milliseconds.
    pub fn created_marker(&self) -> Option<i64> {
        self.metadata
            .get(CREATED_MARKER_KEY)
            .and_then(|value| value.parse().ok())
    }
}

/// Lease and metadata operations on one container.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Acquire a lease; `None` requests an infinite lease. Returns the lease id.
    async fn acquire_lease(&self, blob: &str, duration: Option<Duration>)
    -> BlobStoreResult<String>;

    /// Renew a held lease.
    async fn renew_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()>;

    /// Release a held lease.
    async fn release_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()>;

    /// Create an empty blob with `metadata`, failing if it already exists.
    async fn create_if_absent(&self, blob: &str, metadata: BlobMetadata) -> BlobStoreResult<()>;

    /// Read the blob's metadata, conditioned on `lease_id` when given.
    async fn get_metadata(&self, blob: &str, lease_id: Option<&str>)
    -> BlobStoreResult<BlobMetadata>;

    /// Delete the blob, conditioned on `lease_id` when given.
    ///
    /// Returns `false` when the blob did not exist.
    async fn delete_if_exists(&self, blob: &str, lease_id: Option<&str>) -> BlobStoreResult<bool>;

    /// List blobs whose names start with `prefix`.
    async fn list_blobs(&self, prefix: &str) -> BlobStoreResult<Vec<BlobInfo>>;
}

#[async_trait]
impl<S: BlobStore + ?Sized> BlobStore for std::sync::Arc<S> {
    async fn acquire_lease(
        &self,
        blob: &str,
        duration: Option<Duration>,
    ) -> BlobStoreResult<String> {
        (**self).acquire_lease(blob, duration).await
    }

    async fn renew_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        (**self).renew_lease(blob, lease_id).await
    }

    async fn release_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        (**self).release_lease(blob, lease_id).await
    }

    async fn create_if_absent(&self, blob: &str, metadata: BlobMetadata) -> BlobStoreResult<()> {
        (**self).create_if_absent(blob, metadata).await
    }

    async fn get_metadata(
        &self,
        blob: &str,
        lease_id: Option<&str>,
    ) -> BlobStoreResult<BlobMetadata> {
        (**self).get_metadata(blob, lease_id).await
    }

    async fn delete_if_exists(&self, blob: &str, lease_id: Option<&str>) -> BlobStoreResult<bool> {
        (**self).delete_if_exists(blob, lease_id).await
    }

    async fn list_blobs(&self, prefix: &str) -> BlobStoreResult<Vec<BlobInfo>> {
        (**self).list_blobs(prefix).await
    }
}

/// Metadata stamped on blobs a lock creates on demand.
pub fn creation_marker() -> BlobMetadata {
    let mut metadata = BlobMetadata::new();
    metadata.insert(
        CREATED_MARKER_KEY.to_string(),
        chrono::Utc::now().timestamp_millis().to_string(),
    );
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_marker_round_trips_through_info() {
        let before = chrono::Utc::now().timestamp_millis();
        let info = BlobInfo {
            name: "lock".into(),
            metadata: creation_marker(),
            leased: false,
        };
        let stamped = info.created_marker().unwrap();
        assert!(stamped >= before);
    }

    #[test]
    fn test_unmarked_blob() {
        let info = BlobInfo {
            name: "data".into(),
            metadata: BlobMetadata::new(),
            leased: false,
        };
        assert_eq!(info.created_marker(), None);
    }
}

//! In-process blob store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BlobStoreError, BlobStoreResult};
use crate::store::{BlobInfo, BlobMetadata, BlobStore};

#[derive(Debug, Clone)]
struct ActiveLease {
    id: String,
    length: Option<Duration>,
    expires_at: Option<Instant>,
}

impl ActiveLease {
    fn new(length: Option<Duration>, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            length,
            expires_at: length.map(|d| now + d),
        }
    }

    fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

#[derive(Debug, Clone, Default)]
struct Blob {
    metadata: BlobMetadata,
    lease: Option<ActiveLease>,
}

impl Blob {
    fn active_lease(&self, now: Instant) -> Option<&ActiveLease> {
        self.lease.as_ref().filter(|lease| lease.is_active(now))
    }

    /// Check a lease-conditioned request against the blob's lease.
    fn check_lease(&self, lease_id: Option<&str>, now: Instant) -> BlobStoreResult<()> {
        match (self.active_lease(now), lease_id) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(BlobStoreError::LeaseNotPresent),
            (Some(_), None) => Err(BlobStoreError::LeaseIdMissing),
            (Some(active), Some(id)) if active.id == id => Ok(()),
            (Some(_), Some(_)) => Err(BlobStoreError::LeaseIdMismatch),
        }
    }
}

/// Blob store kept in memory, with lease expiry on the tokio clock.
///
/// Shared between "processes" by cloning an `Arc`. The extra methods let
/// tests break or steal leases the way an operator or a racing client would.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a blob with the given metadata.
    pub fn insert_blob(&self, blob: &str, metadata: BlobMetadata) {
        self.blobs.lock().insert(
            blob.to_string(),
            Blob {
                metadata,
                lease: None,
            },
        );
    }

    /// Whether the blob exists.
    pub fn contains(&self, blob: &str) -> bool {
        self.blobs.lock().contains_key(blob)
    }

    /// Id of the active lease on the blob.
    pub fn lease_id(&self, blob: &str) -> Option<String> {
        let now = Instant::now();
        self.blobs
            .lock()
            .get(blob)
            .and_then(|b| b.active_lease(now))
            .map(|lease| lease.id.clone())
    }

    /// Break the active lease; returns whether there was one.
    pub fn break_lease(&self, blob: &str) -> bool {
        self.blobs
            .lock()
            .get_mut(blob)
            .and_then(|b| b.lease.take())
            .is_some()
    }

    /// Replace any lease with a new one held by someone else.
    pub fn steal_lease(&self, blob: &str, duration: Option<Duration>) -> Option<String> {
        let mut blobs = self.blobs.lock();
        let entry = blobs.get_mut(blob)?;
        let lease = ActiveLease::new(duration, Instant::now());
        let id = lease.id.clone();
        entry.lease = Some(lease);
        Some(id)
    }

    /// Delete a blob regardless of leases.
    pub fn remove_blob(&self, blob: &str) -> bool {
        self.blobs.lock().remove(blob).is_some()
    }

    /// Number of blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn acquire_lease(
        &self,
        blob: &str,
        duration: Option<Duration>,
    ) -> BlobStoreResult<String> {
        let now = Instant::now();
        let mut blobs = self.blobs.lock();
        let entry = blobs
            .get_mut(blob)
            .ok_or_else(|| BlobStoreError::BlobNotFound(blob.to_string()))?;

        if entry.active_lease(now).is_some() {
            return Err(BlobStoreError::LeaseAlreadyPresent);
        }

        let lease = ActiveLease::new(duration, now);
        let id = lease.id.clone();
        entry.lease = Some(lease);
        Ok(id)
    }

    async fn renew_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        let now = Instant::now();
        let mut blobs = self.blobs.lock();
        let entry = blobs
            .get_mut(blob)
            .ok_or_else(|| BlobStoreError::BlobNotFound(blob.to_string()))?;

        // An expired lease can be renewed as long as nobody else took the blob.
        match entry.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                lease.expires_at = lease.length.map(|d| now + d);
                Ok(())
            }
            Some(_) => Err(BlobStoreError::LeaseIdMismatch),
            None => Err(BlobStoreError::LeaseNotPresent),
        }
    }

    async fn release_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        let mut blobs = self.blobs.lock();
        let entry = blobs
            .get_mut(blob)
            .ok_or_else(|| BlobStoreError::BlobNotFound(blob.to_string()))?;

        match &entry.lease {
            Some(lease) if lease.id == lease_id => {
                entry.lease = None;
                Ok(())
            }
            Some(_) => Err(BlobStoreError::LeaseIdMismatch),
            None => Err(BlobStoreError::LeaseNotPresent),
        }
    }

    async fn create_if_absent(&self, blob: &str, metadata: BlobMetadata) -> BlobStoreResult<()> {
        let mut blobs = self.blobs.lock();
        if blobs.contains_key(blob) {
            return Err(BlobStoreError::BlobAlreadyExists(blob.to_string()));
        }
        blobs.insert(
            blob.to_string(),
            Blob {
                metadata,
                lease: None,
            },
        );
        Ok(())
    }

    async fn get_metadata(
        &self,
        blob: &str,
        lease_id: Option<&str>,
    ) -> BlobStoreResult<BlobMetadata> {
        let now = Instant::now();
        let blobs = self.blobs.lock();
        let entry = blobs
            .get(blob)
            .ok_or_else(|| BlobStoreError::BlobNotFound(blob.to_string()))?;

        // Reads only check a lease when one is supplied.
        if lease_id.is_some() {
            entry.check_lease(lease_id, now)?;
        }
        Ok(entry.metadata.clone())
    }

    async fn delete_if_exists(&self, blob: &str, lease_id: Option<&str>) -> BlobStoreResult<bool> {
        let now = Instant::now();
        let mut blobs = self.blobs.lock();
        let Some(entry) = blobs.get(blob) else {
            return Ok(false);
        };

        entry.check_lease(lease_id, now)?;
        blobs.remove(blob);
        Ok(true)
    }

    async fn list_blobs(&self, prefix: &str) -> BlobStoreResult<Vec<BlobInfo>> {
        let now = Instant::now();
        let blobs = self.blobs.lock();
        let mut listing: Vec<BlobInfo> = blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, entry)| BlobInfo {
                name: name.clone(),
                metadata: entry.metadata.clone(),
                leased: entry.active_lease(now).is_some(),
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Option<Duration> = Some(Duration::from_secs(15));

    #[tokio::test]
    async fn test_acquire_requires_blob() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(
            store.acquire_lease("missing", LEASE).await,
            Err(BlobStoreError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_conflict_and_release() {
        let store = InMemoryBlobStore::new();
        store.insert_blob("b", BlobMetadata::new());

        let id = store.acquire_lease("b", LEASE).await.unwrap();
        assert_eq!(
            store.acquire_lease("b", LEASE).await,
            Err(BlobStoreError::LeaseAlreadyPresent)
        );
        assert_eq!(
            store.release_lease("b", "someone-else").await,
            Err(BlobStoreError::LeaseIdMismatch)
        );

        store.release_lease("b", &id).await.unwrap();
        assert!(store.acquire_lease("b", LEASE).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_unless_renewed() {
        let store = InMemoryBlobStore::new();
        store.insert_blob("b", BlobMetadata::new());
        let id = store.acquire_lease("b", LEASE).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        store.renew_lease("b", &id).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.lease_id("b"), Some(id.clone()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.lease_id("b"), None);
        assert!(store.acquire_lease("b", LEASE).await.is_ok());
        assert_eq!(
            store.renew_lease("b", &id).await,
            Err(BlobStoreError::LeaseIdMismatch)
        );
    }

    #[tokio::test]
    async fn test_lease_conditioned_delete() {
        let store = InMemoryBlobStore::new();
        store.insert_blob("b", BlobMetadata::new());
        let id = store.acquire_lease("b", None).await.unwrap();

        assert_eq!(
            store.delete_if_exists("b", None).await,
            Err(BlobStoreError::LeaseIdMissing)
        );
        assert_eq!(
            store.delete_if_exists("b", Some("wrong")).await,
            Err(BlobStoreError::LeaseIdMismatch)
        );
        assert_eq!(store.delete_if_exists("b", Some(id.as_str())).await, Ok(true));
        assert_eq!(store.delete_if_exists("b", Some(id.as_str())).await, Ok(false));
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = InMemoryBlobStore::new();
        store.create_if_absent("b", BlobMetadata::new()).await.unwrap();
        assert!(matches!(
            store.create_if_absent("b", BlobMetadata::new()).await,
            Err(BlobStoreError::BlobAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stolen_lease_fails_metadata_check() {
        let store = InMemoryBlobStore::new();
        store.insert_blob("b", BlobMetadata::new());
        let id = store.acquire_lease("b", LEASE).await.unwrap();

        store.steal_lease("b", LEASE).unwrap();
        assert_eq!(
            store.get_metadata("b", Some(id.as_str())).await,
            Err(BlobStoreError::LeaseIdMismatch)
        );
        assert!(store.get_metadata("b", None).await.is_ok());
    }
}

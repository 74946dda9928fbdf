//! Blob lease distributed lock.

use async_trait::async_trait;
use distlock_core::naming::{replace_invalid_chars, to_safe_name};
use distlock_core::{
    CancellationToken, DistributedLock, LeaseMonitor, LeaseRenewer, LeaseState, LockError,
    LockHandle, LockResult, Release, Timeout, busy_wait,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BlobLeaseOptions;
use crate::error::BlobStoreError;
use crate::store::{BlobStore, CREATED_MARKER_KEY, MAX_BLOB_NAME_LEN, creation_marker};

/// A lock held as a lease on a blob.
///
/// The blob is created on demand (stamped with a creation marker) and deleted
/// on release when this lock created it. A blob that existed before is only
/// leased and left in place.
pub struct BlobLeaseDistributedLock {
    name: String,
    blob: String,
    store: Arc<dyn BlobStore>,
    options: BlobLeaseOptions,
}

impl BlobLeaseDistributedLock {
    /// Create a lock for `name` with default options.
    pub fn new(store: Arc<dyn BlobStore>, name: &str) -> LockResult<Self> {
        Self::with_options(store, name, BlobLeaseOptions::default())
    }

    /// Create a lock for `name`.
    pub fn with_options(
        store: Arc<dyn BlobStore>,
        name: &str,
        options: BlobLeaseOptions,
    ) -> LockResult<Self> {
        options.validate()?;
        Ok(Self {
            name: name.to_string(),
            blob: blob_name(name),
            store,
            options,
        })
    }

    /// Create a lock for `name` whose blob lives under `prefix`.
    ///
    /// The name is mapped into the space left after the prefix, so long
    /// names are hashed instead of overflowing the blob name limit.
    pub fn with_prefix(
        store: Arc<dyn BlobStore>,
        prefix: &str,
        name: &str,
        options: BlobLeaseOptions,
    ) -> LockResult<Self> {
        options.validate()?;
        Ok(Self {
            name: name.to_string(),
            blob: prefixed_blob_name(prefix, name)?,
            store,
            options,
        })
    }

    /// Create a lock on an exact blob name, which may already exist.
    pub fn for_blob(
        store: Arc<dyn BlobStore>,
        blob: impl Into<String>,
        options: BlobLeaseOptions,
    ) -> LockResult<Self> {
        options.validate()?;
        let blob = blob.into();
        if !is_valid_blob_name(&blob) {
            return Err(LockError::InvalidName(format!(
                "'{}' is not a valid blob name",
                blob
            )));
        }
        Ok(Self {
            name: blob.clone(),
            blob,
            store,
            options,
        })
    }

    /// Name of the blob backing the lock.
    pub fn blob(&self) -> &str {
        &self.blob
    }

    async fn try_acquire_once(&self) -> LockResult<Option<LockHandle>> {
        let lease = self.options.lease()?;
        let duration = self.options.lease_duration;

        let (lease_id, created) = match self.store.acquire_lease(&self.blob, duration).await {
            Ok(lease_id) => (lease_id, false),
            Err(BlobStoreError::LeaseAlreadyPresent) => return Ok(None),
            Err(BlobStoreError::BlobNotFound(_)) => {
                match self.store.create_if_absent(&self.blob, creation_marker()).await {
                    Ok(()) => debug!(lock = %self.name, blob = %self.blob, "Created lock blob"),
                    Err(BlobStoreError::BlobAlreadyExists(_)) => return Ok(None),
                    Err(e) if e.is_contention() => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                match self.store.acquire_lease(&self.blob, duration).await {
                    Ok(lease_id) => (lease_id, true),
                    Err(BlobStoreError::LeaseAlreadyPresent | BlobStoreError::BlobNotFound(_)) => {
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let owns_blob = created || self.has_marker(&lease_id).await?;
        info!(lock = %self.name, blob = %self.blob, owns_blob, "Acquired blob lease");

        let lost = CancellationToken::new();
        let renewer = Arc::new(BlobLeaseRenewer {
            store: self.store.clone(),
            blob: self.blob.clone(),
            lease_id: lease_id.clone(),
            renew: self.options.renews(),
        });
        let monitor = LeaseMonitor::start(&self.name, lease, renewer, lost.clone());

        let release = BlobLeaseRelease {
            store: self.store.clone(),
            blob: self.blob.clone(),
            lease_id,
            owns_blob,
        };
        Ok(Some(
            LockHandle::new(self.name.clone(), lost, release).with_monitor(monitor),
        ))
    }

    async fn has_marker(&self, lease_id: &str) -> LockResult<bool> {
        match self.store.get_metadata(&self.blob, Some(lease_id)).await {
            Ok(metadata) => Ok(metadata.contains_key(CREATED_MARKER_KEY)),
            Err(e) => {
                if let Err(release_error) = self.store.release_lease(&self.blob, lease_id).await {
                    warn!(lock = %self.name, error = %release_error, "Failed to release lease after metadata error");
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl DistributedLock for BlobLeaseDistributedLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        busy_wait(&self.options.busy_wait, timeout, cancel, |_| {
            self.try_acquire_once()
        })
        .await
    }
}

impl std::fmt::Debug for BlobLeaseDistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobLeaseDistributedLock")
            .field("name", &self.name)
            .field("blob", &self.blob)
            .field("options", &self.options)
            .finish()
    }
}

/// Renews or validates a held blob lease for the monitor.
struct BlobLeaseRenewer {
    store: Arc<dyn BlobStore>,
    blob: String,
    lease_id: String,
    renew: bool,
}

#[async_trait]
impl LeaseRenewer for BlobLeaseRenewer {
    async fn renew_or_validate(&self, cancel: &CancellationToken) -> LeaseState {
        let (outcome, success) = if self.renew {
            let call = self.store.renew_lease(&self.blob, &self.lease_id);
            tokio::select! {
                _ = cancel.cancelled() => return LeaseState::Unknown,
                result = call => (result.map(|_| ()), LeaseState::Renewed),
            }
        } else {
            let call = self.store.get_metadata(&self.blob, Some(self.lease_id.as_str()));
            tokio::select! {
                _ = cancel.cancelled() => return LeaseState::Unknown,
                result = call => (result.map(|_| ()), LeaseState::Held),
            }
        };

        match outcome {
            Ok(()) => success,
            Err(e) if e.is_lease_lost() => {
                debug!(blob = %self.blob, error = %e, "Blob lease is gone");
                LeaseState::Lost
            }
            Err(e) => {
                debug!(blob = %self.blob, error = %e, "Blob lease check failed");
                LeaseState::Unknown
            }
        }
    }
}

struct BlobLeaseRelease {
    store: Arc<dyn BlobStore>,
    blob: String,
    lease_id: String,
    owns_blob: bool,
}

#[async_trait]
impl Release for BlobLeaseRelease {
    async fn release(self: Box<Self>) -> LockResult<()> {
        let result = if self.owns_blob {
            self.store
                .delete_if_exists(&self.blob, Some(self.lease_id.as_str()))
                .await
                .map(|_| ())
        } else {
            self.store.release_lease(&self.blob, &self.lease_id).await
        };

        match result {
            Ok(()) => {
                info!(blob = %self.blob, deleted = self.owns_blob, "Released blob lease");
                Ok(())
            }
            // Someone else already ended the lease; nothing left to release.
            Err(e) if e.is_lease_lost() => {
                warn!(blob = %self.blob, error = %e, "Blob lease was already lost on release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Map a lock name onto a valid blob name.
pub fn blob_name(name: &str) -> String {
    map_blob_name(name, MAX_BLOB_NAME_LEN)
}

/// Map a lock name to a blob name under `prefix`.
pub fn prefixed_blob_name(prefix: &str, name: &str) -> LockResult<String> {
    let budget = MAX_BLOB_NAME_LEN.saturating_sub(prefix.len());
    if budget == 0 || !prefix.chars().all(is_valid_blob_char) {
        return Err(LockError::InvalidName(format!(
            "'{}' is not a usable blob prefix",
            prefix
        )));
    }
    Ok(format!("{}{}", prefix, map_blob_name(name, budget)))
}

fn map_blob_name(name: &str, max_len: usize) -> String {
    to_safe_name(name, max_len, is_valid_blob_name, |n| {
        replace_invalid_chars(n, is_valid_blob_char)
    })
}

fn is_valid_blob_char(c: char) -> bool {
    !c.is_control() && c != '\\'
}

fn is_valid_blob_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_BLOB_NAME_LEN
        && !name.ends_with('.')
        && !name.ends_with('/')
        && name.chars().all(is_valid_blob_char)
}

//! Removal of lock blobs left behind by crashed holders.

use async_trait::async_trait;
use distlock_core::{LockResult, Reap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::store::BlobStore;

/// Deletes unleased blobs carrying the creation marker once they are older
/// than the grace period.
///
/// Blobs without the marker were not created by a lock and are never touched.
pub struct BlobLeaseReaper {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl BlobLeaseReaper {
    /// Create a reaper for blobs whose names start with `prefix`.
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Reap for BlobLeaseReaper {
    async fn reap(&self, grace: Duration) -> LockResult<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let grace_millis = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let mut removed = 0;

        for blob in self.store.list_blobs(&self.prefix).await? {
            let Some(created) = blob.created_marker() else {
                continue;
            };
            if blob.leased || now.saturating_sub(created) < grace_millis {
                trace!(blob = %blob.name, "Lock blob is held or too young to reap");
                continue;
            }

            // Without a lease id the delete fails if a holder leased it meanwhile.
            match self.store.delete_if_exists(&blob.name, None).await {
                Ok(true) => {
                    debug!(blob = %blob.name, "Reaped abandoned lock blob");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => debug!(blob = %blob.name, error = %e, "Skipping lock blob"),
            }
        }

        Ok(removed)
    }
}

//! Lock factory over one blob container.

use distlock_core::{LockProvider, LockResult, Reaper, ReaperConfig};
use std::sync::Arc;

use crate::config::BlobLeaseConfig;
use crate::lock::BlobLeaseDistributedLock;
use crate::reaper::BlobLeaseReaper;
use crate::store::BlobStore;

/// Creates [`BlobLeaseDistributedLock`]s on a shared [`BlobStore`].
#[derive(Clone)]
pub struct BlobLeaseProvider {
    store: Arc<dyn BlobStore>,
    config: BlobLeaseConfig,
}

impl BlobLeaseProvider {
    /// Create a provider.
    pub fn new(store: Arc<dyn BlobStore>, config: BlobLeaseConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The provider's configuration.
    pub fn config(&self) -> &BlobLeaseConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Start a background sweep for abandoned lock blobs under the prefix.
    pub fn start_reaper(&self, config: ReaperConfig) -> Reaper {
        let reaper = BlobLeaseReaper::new(self.store.clone(), self.config.prefix.clone());
        Reaper::start(Arc::new(reaper), config)
    }
}

impl LockProvider for BlobLeaseProvider {
    type Lock = BlobLeaseDistributedLock;

    fn create_lock(&self, name: &str) -> LockResult<BlobLeaseDistributedLock> {
        if self.config.prefix.is_empty() {
            BlobLeaseDistributedLock::with_options(self.store.clone(), name, self.config.options)
        } else {
            BlobLeaseDistributedLock::with_prefix(
                self.store.clone(),
                &self.config.prefix,
                name,
                self.config.options,
            )
        }
    }
}

impl std::fmt::Debug for BlobLeaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobLeaseProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Lock factory over one ensemble.

use distlock_core::{LockProvider, LockResult, SemaphoreProvider};
use std::sync::Arc;

use crate::config::ZooKeeperConfig;
use crate::lock::ZooKeeperDistributedLock;
use crate::pool::SessionPool;
use crate::rw_lock::ZooKeeperDistributedReaderWriterLock;
use crate::semaphore::ZooKeeperDistributedSemaphore;
use crate::session::EnsembleConnector;

/// Creates ensemble locks and semaphores sharing one session pool.
#[derive(Clone)]
pub struct ZooKeeperProvider {
    pool: SessionPool,
    config: ZooKeeperConfig,
}

impl ZooKeeperProvider {
    /// Create a provider with its own session pool.
    pub fn new(connector: Arc<dyn EnsembleConnector>, config: ZooKeeperConfig) -> LockResult<Self> {
        config.validate()?;
        let pool = SessionPool::new(connector, config.max_session_age);
        Ok(Self { pool, config })
    }

    /// Create a provider on an existing pool.
    pub fn with_pool(pool: SessionPool, config: ZooKeeperConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    /// The provider's configuration.
    pub fn config(&self) -> &ZooKeeperConfig {
        &self.config
    }

    /// The shared session pool.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Create a reader-writer lock for `name`.
    pub fn create_reader_writer_lock(
        &self,
        name: &str,
    ) -> LockResult<ZooKeeperDistributedReaderWriterLock> {
        ZooKeeperDistributedReaderWriterLock::new(name, &self.config, self.pool.clone())
    }
}

impl LockProvider for ZooKeeperProvider {
    type Lock = ZooKeeperDistributedLock;

    fn create_lock(&self, name: &str) -> LockResult<ZooKeeperDistributedLock> {
        ZooKeeperDistributedLock::new(name, &self.config, self.pool.clone())
    }
}

impl SemaphoreProvider for ZooKeeperProvider {
    type Semaphore = ZooKeeperDistributedSemaphore;

    fn create_semaphore(
        &self,
        name: &str,
        max_count: u32,
    ) -> LockResult<ZooKeeperDistributedSemaphore> {
        ZooKeeperDistributedSemaphore::new(name, max_count, &self.config, self.pool.clone())
    }
}

impl std::fmt::Debug for ZooKeeperProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZooKeeperProvider")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

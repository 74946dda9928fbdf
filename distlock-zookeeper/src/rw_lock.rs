//! Reader-writer ensemble lock.
//!
//! Readers queue `read-` nodes and hold as soon as no `write-` node is ahead
//! of them; writers queue `write-` nodes and hold only at the head of the
//! combined queue.

use async_trait::async_trait;
use distlock_core::{CancellationToken, DistributedLock, LockHandle, LockResult, Timeout};

use crate::config::ZooKeeperConfig;
use crate::node::{NodeLock, NodePolicy};
use crate::pool::SessionPool;

/// Shared/exclusive lock over one node path.
#[derive(Debug, Clone)]
pub struct ZooKeeperDistributedReaderWriterLock {
    node: NodeLock,
}

impl ZooKeeperDistributedReaderWriterLock {
    /// Create a reader-writer lock for `name` under `config.root`.
    pub fn new(name: &str, config: &ZooKeeperConfig, pool: SessionPool) -> LockResult<Self> {
        Ok(Self {
            node: NodeLock::new(
                name,
                &config.root,
                config.connection.clone(),
                pool,
                config.options.clone(),
            )?,
        })
    }

    /// Name of the lock.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Node path holding the combined queue.
    pub fn path(&self) -> &str {
        self.node.path()
    }

    /// The shared side.
    pub fn read(&self) -> ZooKeeperReadLock {
        ZooKeeperReadLock {
            node: self.node.clone(),
        }
    }

    /// The exclusive side.
    pub fn write(&self) -> ZooKeeperWriteLock {
        ZooKeeperWriteLock {
            node: self.node.clone(),
        }
    }
}

/// Shared side of a [`ZooKeeperDistributedReaderWriterLock`].
#[derive(Debug, Clone)]
pub struct ZooKeeperReadLock {
    node: NodeLock,
}

#[async_trait]
impl DistributedLock for ZooKeeperReadLock {
    fn name(&self) -> &str {
        self.node.name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        self.node.try_acquire(NodePolicy::Read, timeout, cancel).await
    }
}

/// Exclusive side of a [`ZooKeeperDistributedReaderWriterLock`].
#[derive(Debug, Clone)]
pub struct ZooKeeperWriteLock {
    node: NodeLock,
}

#[async_trait]
impl DistributedLock for ZooKeeperWriteLock {
    fn name(&self) -> &str {
        self.node.name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        self.node.try_acquire(NodePolicy::Write, timeout, cancel).await
    }
}

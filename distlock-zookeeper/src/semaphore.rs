//! Counting ensemble semaphore.

use async_trait::async_trait;
use distlock_core::{
    CancellationToken, DistributedLock, DistributedSemaphore, LockError, LockHandle, LockResult,
    Timeout,
};

use crate::config::ZooKeeperConfig;
use crate::node::{NodeLock, NodePolicy};
use crate::pool::SessionPool;

/// Up to `max_count` concurrent holders over `semaphore-` nodes.
///
/// A node holds a ticket when it is among the first `max_count` in the queue
/// and fewer than `max_count` other nodes are stamped as holders.
#[derive(Debug, Clone)]
pub struct ZooKeeperDistributedSemaphore {
    node: NodeLock,
    max_count: u32,
}

impl ZooKeeperDistributedSemaphore {
    /// Create a semaphore for `name` with `max_count` tickets.
    pub fn new(
        name: &str,
        max_count: u32,
        config: &ZooKeeperConfig,
        pool: SessionPool,
    ) -> LockResult<Self> {
        if max_count == 0 {
            return Err(LockError::Config("semaphore max_count must be at least 1".into()));
        }
        Ok(Self {
            node: NodeLock::new(
                name,
                &config.root,
                config.connection.clone(),
                pool,
                config.options.clone(),
            )?,
            max_count,
        })
    }

    /// Node path holding this semaphore's queue.
    pub fn path(&self) -> &str {
        self.node.path()
    }
}

#[async_trait]
impl DistributedLock for ZooKeeperDistributedSemaphore {
    fn name(&self) -> &str {
        self.node.name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        let policy = NodePolicy::Semaphore {
            max_count: self.max_count,
        };
        self.node.try_acquire(policy, timeout, cancel).await
    }
}

impl DistributedSemaphore for ZooKeeperDistributedSemaphore {
    fn max_count(&self) -> u32 {
        self.max_count
    }
}

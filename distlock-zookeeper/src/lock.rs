//! Exclusive ensemble lock.

use async_trait::async_trait;
use distlock_core::{CancellationToken, DistributedLock, LockHandle, LockResult, Timeout};

use crate::config::ZooKeeperConfig;
use crate::node::{NodeLock, NodePolicy};
use crate::pool::SessionPool;

/// Mutual exclusion through a queue of `lock-` ephemeral-sequential nodes.
///
/// Waiters are served in sequence order: each watches the node directly
/// ahead of it, so a release wakes exactly one waiter.
#[derive(Debug, Clone)]
pub struct ZooKeeperDistributedLock {
    node: NodeLock,
}

impl ZooKeeperDistributedLock {
    /// Create a lock for `name` under `config.root`.
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

    /// Node path holding this lock's queue.
    pub fn path(&self) -> &str {
        self.node.path()
    }
}

#[async_trait]
impl DistributedLock for ZooKeeperDistributedLock {
    fn name(&self) -> &str {
        self.node.name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        self.node
            .try_acquire(NodePolicy::Exclusive, timeout, cancel)
            .await
    }
}

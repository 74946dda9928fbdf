//! Sequential ephemeral node recipe.
//!
//! Every ensemble primitive queues the same way: create an
//! ephemeral-sequential child under the lock path, list the queue, and either
//! hold or watch whoever is in the way. [`NodePolicy`] decides what "in the
//! way" means for exclusive locks, semaphores, readers and writers.

use async_trait::async_trait;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use distlock_core::{LockError, LockHandle, LockResult, Release, Timeout};

use crate::config::{Acl, ConnectionParams, ZooKeeperOptions};
use crate::error::EnsembleError;
use crate::path::{self, lock_path, sequence_number};
use crate::pool::{PooledSession, SessionPool};
use crate::session::{CreateMode, WatchEventKind};

/// Data stamped on a semaphore node once it holds a ticket.
pub const ACQUIRED_MARKER: &[u8] = b"acquired";

const LOCK_PREFIX: &str = "lock-";
const SEMAPHORE_PREFIX: &str = "semaphore-";
const READ_PREFIX: &str = "read-";
const WRITE_PREFIX: &str = "write-";

const MAX_CREATE_ATTEMPTS: u32 = 10;
const MAX_MISSING_LISTINGS: u32 = 3;

/// Rule deciding when a queued node holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePolicy {
    /// First in the queue.
    Exclusive,
    /// Among the first `max_count`, with fewer than `max_count` marked holders.
    Semaphore { max_count: u32 },
    /// No writer ahead.
    Read,
    /// First among readers and writers.
    Write,
}

impl NodePolicy {
    /// Name prefix of the nodes this policy creates.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Exclusive => LOCK_PREFIX,
            Self::Semaphore { .. } => SEMAPHORE_PREFIX,
            Self::Read => READ_PREFIX,
            Self::Write => WRITE_PREFIX,
        }
    }

    fn queue_prefixes(&self) -> &'static [&'static str] {
        match self {
            Self::Exclusive => &[LOCK_PREFIX],
            Self::Semaphore { .. } => &[SEMAPHORE_PREFIX],
            Self::Read | Self::Write => &[READ_PREFIX, WRITE_PREFIX],
        }
    }
}

#[derive(Debug, Clone)]
struct Sibling {
    name: String,
    sequence: u64,
    ctime: i64,
}

enum Decision {
    Acquired,
    Wait(Vec<String>),
}

/// One named queue on the ensemble.
#[derive(Clone)]
pub(crate) struct NodeLock {
    name: String,
    path: String,
    params: ConnectionParams,
    pool: SessionPool,
    options: ZooKeeperOptions,
}

impl NodeLock {
    pub(crate) fn new(
        name: &str,
        root: &str,
        params: ConnectionParams,
        pool: SessionPool,
        options: ZooKeeperOptions,
    ) -> LockResult<Self> {
        if name.is_empty() {
            return Err(LockError::InvalidName("lock name must not be empty".into()));
        }
        let path = lock_path(root, name);
        path::validate_path(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            params,
            pool,
            options,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) async fn try_acquire(
        &self,
        policy: NodePolicy,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let deadline = timeout.deadline_from(Instant::now());
        let session = self.pool.acquire(&self.params).await?;

        let mut created_parent = false;
        let node = match self.create_node(&session, policy, &mut created_parent).await {
            Ok(node) => node,
            Err(e) => {
                self.abandon(&session, None, created_parent).await;
                return Err(e);
            }
        };
        debug!(lock = %self.name, node = %node, "Queued ensemble node");
        let mut pending = PendingNode::new(&session, &node, &self.path, created_parent);

        let acquired = match self
            .wait_for_turn(&session, policy, &node, deadline, cancel)
            .await
        {
            Ok(true) => self.mark_holder(&session, policy, &node).await,
            other => other,
        };
        match acquired {
            Ok(true) => pending.disarm(),
            Ok(false) => {
                debug!(lock = %self.name, node = %node, "Ensemble lock timed out");
                self.abandon(&session, Some(&node), created_parent).await;
                pending.disarm();
                return Ok(None);
            }
            Err(e) => {
                self.abandon(&session, Some(&node), created_parent).await;
                pending.disarm();
                return Err(e);
            }
        }

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        tokio::spawn(watch_node(
            session.clone(),
            self.name.clone(),
            node.clone(),
            lost.clone(),
            stop.clone(),
        ));
        info!(lock = %self.name, node = %node, "Acquired ensemble lock");

        let release = NodeRelease {
            session,
            node,
            parent: self.path.clone(),
            delete_parent: created_parent,
            stop_watch: stop.drop_guard(),
        };
        Ok(Some(LockHandle::new(self.name.clone(), lost, release)))
    }

    async fn create_node(
        &self,
        session: &PooledSession,
        policy: NodePolicy,
        created_parent: &mut bool,
    ) -> LockResult<String> {
        let acl = &self.options.acl;
        if !self.options.assume_path_exists {
            *created_parent |= ensure_path(session, &self.path, acl).await?;
        }

        let prefix = path::join(&self.path, policy.prefix());
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            match session
                .create(&prefix, Vec::new(), CreateMode::EphemeralSequential, acl)
                .await
            {
                Ok(node) => return Ok(node),
                Err(EnsembleError::NoNode(_)) if self.options.assume_path_exists => {
                    return Err(LockError::Config(format!(
                        "lock path {} does not exist",
                        self.path
                    )));
                }
                Err(EnsembleError::NoNode(_)) => {
                    debug!(lock = %self.name, attempt, "Lock path vanished; recreating");
                    *created_parent |= ensure_path(session, &self.path, acl).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LockError::RetriesExhausted {
            attempts: MAX_CREATE_ATTEMPTS,
            reason: format!("lock path {} kept disappearing", self.path),
        })
    }

    async fn wait_for_turn(
        &self,
        session: &PooledSession,
        policy: NodePolicy,
        node: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> LockResult<bool> {
        let own = path::node_name(node);
        let mut seen = false;
        let mut missing_listings = 0;

        loop {
            let siblings = self.list_siblings(session, policy).await?;
            let Some(index) = siblings.iter().position(|s| s.name == own) else {
                missing_listings += 1;
                if seen || missing_listings > MAX_MISSING_LISTINGS {
                    return Err(LockError::Lost(format!("node {} disappeared", node)));
                }
                tokio::task::yield_now().await;
                continue;
            };
            seen = true;

            let targets = match self
                .evaluate(session, policy, &siblings, index)
                .await?
            {
                Decision::Acquired => return Ok(true),
                Decision::Wait(targets) => targets,
            };
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }

            let mut receivers = Vec::with_capacity(targets.len());
            for target in &targets {
                match session.watch(&path::join(&self.path, target)).await? {
                    Some((_, receiver)) => receivers.push(receiver),
                    None => {
                        receivers.clear();
                        break;
                    }
                }
            }
            if receivers.is_empty() {
                continue;
            }

            debug!(lock = %self.name, node = %own, waiting_on = ?targets, "Waiting for ensemble lock");
            let lost = session.connection_lost();
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = lost.cancelled() => {
                    return Err(LockError::ConnectionLost(format!(
                        "session lost while waiting for {}",
                        self.name
                    )));
                }
                _ = sleep_until(deadline) => {}
                _ = futures::future::select_all(receivers) => {}
            }
        }
    }

    /// Queue members relevant to `policy`, in queue order.
    async fn list_siblings(
        &self,
        session: &PooledSession,
        policy: NodePolicy,
    ) -> LockResult<Vec<Sibling>> {
        let children = match session.get_children(&self.path).await {
            Ok(children) => children,
            Err(EnsembleError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let prefixes = policy.queue_prefixes();
        let mut siblings: Vec<Sibling> = children
            .into_iter()
            .filter_map(|child| {
                let prefix = prefixes.iter().find(|p| child.starts_with(**p))?;
                let sequence = sequence_number(&child, prefix)?;
                Some(Sibling {
                    name: child,
                    sequence,
                    ctime: 0,
                })
            })
            .collect();
        siblings.sort_by_key(|s| s.sequence);

        // Sequence numbers only collide after the counter wraps; order those by creation time.
        let has_ties = siblings.windows(2).any(|w| w[0].sequence == w[1].sequence);
        if has_ties {
            let mut dated = Vec::with_capacity(siblings.len());
            for mut sibling in siblings {
                if let Some(stat) = session.exists(&path::join(&self.path, &sibling.name)).await? {
                    sibling.ctime = stat.ctime;
                    dated.push(sibling);
                }
            }
            dated.sort_by_key(|s| (s.sequence, s.ctime));
            siblings = dated;
        }
        Ok(siblings)
    }

    async fn evaluate(
        &self,
        session: &PooledSession,
        policy: NodePolicy,
        siblings: &[Sibling],
        index: usize,
    ) -> LockResult<Decision> {
        let decision = match policy {
            NodePolicy::Exclusive | NodePolicy::Write => {
                if index == 0 {
                    Decision::Acquired
                } else {
                    Decision::Wait(vec![siblings[index - 1].name.clone()])
                }
            }
            NodePolicy::Read => match siblings[..index]
                .iter()
                .rev()
                .find(|s| s.name.starts_with(WRITE_PREFIX))
            {
                Some(writer) => Decision::Wait(vec![writer.name.clone()]),
                None => Decision::Acquired,
            },
            NodePolicy::Semaphore { max_count } => {
                let max_count = max_count as usize;
                if index >= max_count {
                    return Ok(Decision::Wait(
                        siblings[..max_count].iter().map(|s| s.name.clone()).collect(),
                    ));
                }

                let own = &siblings[index].name;
                let mut holders = Vec::new();
                for sibling in siblings.iter().filter(|s| &s.name != own) {
                    match session.get_data(&path::join(&self.path, &sibling.name)).await {
                        Ok((data, _)) if data == ACQUIRED_MARKER => holders.push(sibling.name.clone()),
                        Ok(_) | Err(EnsembleError::NoNode(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                if holders.len() < max_count {
                    Decision::Acquired
                } else {
                    Decision::Wait(holders)
                }
            }
        };
        Ok(decision)
    }

    async fn mark_holder(
        &self,
        session: &PooledSession,
        policy: NodePolicy,
        node: &str,
    ) -> LockResult<bool> {
        if !matches!(policy, NodePolicy::Semaphore { .. }) {
            return Ok(true);
        }
        match session.set_data(node, ACQUIRED_MARKER.to_vec(), None).await {
            Ok(_) => Ok(true),
            Err(EnsembleError::NoNode(_)) => {
                Err(LockError::Lost(format!("node {} disappeared", node)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove what a failed attempt left behind.
    async fn abandon(&self, session: &PooledSession, node: Option<&str>, created_parent: bool) {
        if let Some(node) = node {
            match session.delete(node, None).await {
                Ok(()) | Err(EnsembleError::NoNode(_)) => {}
                Err(e) if e.is_connection_loss() => {}
                Err(e) => warn!(lock = %self.name, node = %node, error = %e, "Failed to delete abandoned node"),
            }
        }
        if created_parent {
            let session = session.clone();
            let parent = self.path.clone();
            tokio::spawn(async move { delete_parent(&session, &parent).await });
        }
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("connect", &self.params.connect_string)
            .finish()
    }
}

/// Create the missing nodes of `path`; returns whether `path` itself was created.
async fn ensure_path(session: &PooledSession, path: &str, acl: &[Acl]) -> LockResult<bool> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(candidate) = current {
        if session.exists(candidate).await?.is_some() {
            break;
        }
        missing.push(candidate);
        current = path::parent(candidate);
    }

    let mut created = false;
    for candidate in missing.into_iter().rev() {
        match session
            .create(candidate, Vec::new(), CreateMode::Persistent, acl)
            .await
        {
            Ok(_) => created = candidate == path,
            Err(EnsembleError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(created)
}

async fn delete_parent(session: &PooledSession, parent: &str) {
    match session.delete(parent, None).await {
        Ok(()) => debug!(path = %parent, "Deleted lock path"),
        Err(EnsembleError::NotEmpty(_)) | Err(EnsembleError::NoNode(_)) => {}
        Err(e) => debug!(path = %parent, error = %e, "Could not delete lock path"),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fire `lost` when the held node goes away.
async fn watch_node(
    session: PooledSession,
    name: String,
    node: String,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    let connection = session.connection_lost();
    loop {
        let watched = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            watched = session.watch(&node) => watched,
        };
        let receiver = match watched {
            Ok(Some((_, receiver))) => receiver,
            Ok(None) => {
                warn!(lock = %name, node = %node, "Held ensemble node is gone");
                lost.cancel();
                return;
            }
            Err(e) => {
                warn!(lock = %name, node = %node, error = %e, "Lost ensemble lock");
                lost.cancel();
                return;
            }
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = connection.cancelled() => {
                warn!(lock = %name, node = %node, "Ensemble session lost while holding lock");
                lost.cancel();
                return;
            }
            event = receiver => match event {
                Ok(event) if event.kind == WatchEventKind::NodeDataChanged => continue,
                _ => {
                    if stop.is_cancelled() {
                        return;
                    }
                    warn!(lock = %name, node = %node, "Held ensemble node was deleted");
                    lost.cancel();
                    return;
                }
            },
        }
    }
}

/// A queued node not yet owned by a handle.
///
/// Dropping it while armed (the acquisition future was dropped mid-wait)
/// deletes the node in the background so it does not block the queue for
/// the rest of the session's life.
struct PendingNode {
    armed: Option<(PooledSession, String)>,
    parent: String,
    created_parent: bool,
}

impl PendingNode {
    fn new(session: &PooledSession, node: &str, parent: &str, created_parent: bool) -> Self {
        Self {
            armed: Some((session.clone(), node.to_string())),
            parent: parent.to_string(),
            created_parent,
        }
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

impl Drop for PendingNode {
    fn drop(&mut self) {
        let Some((session, node)) = self.armed.take() else {
            return;
        };
        let parent = std::mem::take(&mut self.parent);
        let owns_parent = self.created_parent;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    debug!(node = %node, "Acquisition dropped; removing queued node");
                    match session.delete(&node, None).await {
                        Ok(()) | Err(EnsembleError::NoNode(_)) => {}
                        Err(e) => warn!(node = %node, error = %e, "Failed to delete dropped node"),
                    }
                    if owns_parent {
                        delete_parent(&session, &parent).await;
                    }
                });
            }
            Err(_) => {
                warn!(node = %node, "Acquisition dropped outside a tokio runtime; node expires with its session");
            }
        }
    }
}

struct NodeRelease {
    session: PooledSession,
    node: String,
    parent: String,
    delete_parent: bool,
    stop_watch: DropGuard,
}

#[async_trait]
impl Release for NodeRelease {
    async fn release(self: Box<Self>) -> LockResult<()> {
        let NodeRelease {
            session,
            node,
            parent,
            delete_parent: owns_parent,
            stop_watch,
        } = *self;
        drop(stop_watch);

        match session.delete(&node, None).await {
            Ok(()) => info!(node = %node, "Released ensemble lock"),
            Err(EnsembleError::NoNode(_)) => {
                warn!(node = %node, "Ensemble node was already gone on release");
            }
            Err(e) if e.is_connection_loss() => {
                warn!(node = %node, error = %e, "Session lost before release; node expires with it");
            }
            Err(e) => return Err(e.into()),
        }

        if owns_parent {
            delete_parent(&session, &parent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEnsemble;
    use std::sync::Arc;
    use std::time::Duration;

    fn node_lock(ensemble: &InMemoryEnsemble, name: &str) -> NodeLock {
        let pool = SessionPool::new(Arc::new(ensemble.clone()), Duration::from_secs(600));
        NodeLock::new(
            name,
            "/distlock",
            ConnectionParams::new("localhost:2181").unwrap(),
            pool,
            ZooKeeperOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_policy_prefixes() {
        assert_eq!(NodePolicy::Exclusive.prefix(), "lock-");
        assert_eq!(NodePolicy::Semaphore { max_count: 2 }.prefix(), "semaphore-");
        assert_eq!(NodePolicy::Read.queue_prefixes(), &["read-", "write-"]);
        assert_eq!(NodePolicy::Write.queue_prefixes(), &["read-", "write-"]);
    }

    #[tokio::test]
    async fn test_acquire_creates_path_and_release_removes_it() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "orders");

        let handle = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ensemble.children("/distlock/orders"), vec!["lock-0000000000"]);

        handle.release().await.unwrap();
        assert!(!ensemble.contains("/distlock/orders"));
        assert!(ensemble.contains("/distlock"));
    }

    #[tokio::test]
    async fn test_zero_timeout_probe_leaves_no_node() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "orders");
        let cancel = CancellationToken::new();

        let held = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        let probe = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap();
        assert!(probe.is_none());
        assert_eq!(ensemble.children("/distlock/orders").len(), 1);

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_assume_path_exists_reports_missing_path() {
        let ensemble = InMemoryEnsemble::new();
        let pool = SessionPool::new(Arc::new(ensemble.clone()), Duration::from_secs(600));
        let options = ZooKeeperOptions {
            assume_path_exists: true,
            ..ZooKeeperOptions::default()
        };
        let lock = NodeLock::new(
            "orders",
            "/distlock",
            ConnectionParams::new("localhost").unwrap(),
            pool,
            options,
        )
        .unwrap();

        let result = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LockError::Config(_))));
    }

    #[tokio::test]
    async fn test_semaphore_stamps_marker() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "pool");
        let policy = NodePolicy::Semaphore { max_count: 2 };
        let cancel = CancellationToken::new();

        let first = lock.try_acquire(policy, Timeout::ZERO, &cancel).await.unwrap().unwrap();
        assert_eq!(
            ensemble.data("/distlock/pool/semaphore-0000000000"),
            Some(ACQUIRED_MARKER.to_vec())
        );
        let second = lock.try_acquire(policy, Timeout::ZERO, &cancel).await.unwrap().unwrap();
        assert!(lock.try_acquire(policy, Timeout::ZERO, &cancel).await.unwrap().is_none());

        first.release().await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_acquisition_removes_queued_node() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "job");
        let cancel = CancellationToken::new();

        let held = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            lock.try_acquire(NodePolicy::Exclusive, Timeout::INFINITE, &cancel),
        )
        .await;
        assert!(waiting.is_err());

        held.release().await.unwrap();
        for _ in 0..100 {
            if ensemble.children("/distlock/job").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(ensemble.children("/distlock/job").is_empty());

        let next = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_queue_order_survives_sequence_wrap() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "orders");
        let cancel = CancellationToken::new();

        let first = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(ensemble.set_next_sequence("/distlock/orders", i32::MAX));

        let waiter = lock.clone();
        let second = tokio::spawn(async move {
            waiter
                .try_acquire(NodePolicy::Exclusive, Timeout::from_secs(5), &CancellationToken::new())
                .await
        });
        while ensemble.children("/distlock/orders").len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        first.release().await.unwrap();
        let second = second.await.unwrap().unwrap().unwrap();
        assert_eq!(ensemble.children("/distlock/orders"), vec!["lock-2147483647"]);

        // Queued behind the holder even though its suffix is negative.
        let behind = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap();
        assert!(behind.is_none());
        assert!(!second.is_lost());

        second.release().await.unwrap();
        let third = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ensemble.children("/distlock/orders"), vec!["lock--2147483647"]);
        third.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_node_fires_lost_token() {
        let ensemble = InMemoryEnsemble::new();
        let lock = node_lock(&ensemble, "orders");

        let handle = lock
            .try_acquire(NodePolicy::Exclusive, Timeout::ZERO, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let lost = handle.lost_token();
        tokio::task::yield_now().await;

        ensemble.remove("/distlock/orders/lock-0000000000").unwrap();
        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .unwrap();

        // Release still succeeds once the node is gone.
        handle.release().await.unwrap();
    }
}

//! Distributed lock and semaphore contract.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{LockError, LockResult};
use crate::handle::LockHandle;
use crate::timeout::Timeout;

/// Distributed lock trait.
///
/// Every backend implements the same caller-facing behavior: contention is
/// `Ok(None)` from the `try_acquire*` methods and a [`LockError::Timeout`]
/// from the `acquire*` methods.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Name of the lock.
    fn name(&self) -> &str;

    /// Try to acquire, waiting up to `timeout`.
    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>>;

    /// Try to acquire (non-blocking)
    async fn try_acquire(&self) -> LockResult<Option<LockHandle>> {
        self.try_acquire_with(Timeout::ZERO, &CancellationToken::new())
            .await
    }

    /// Acquire, failing with [`LockError::Timeout`] after `timeout`.
    async fn acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<LockHandle> {
        match self.try_acquire_with(timeout, cancel).await? {
            Some(handle) => Ok(handle),
            None => Err(LockError::timeout(self.name(), timeout.as_reported())),
        }
    }

    /// Acquire with timeout
    async fn acquire_timeout(&self, timeout: std::time::Duration) -> LockResult<LockHandle> {
        self.acquire_with(timeout.into(), &CancellationToken::new())
            .await
    }

    /// Acquire the lock, waiting as long as it takes.
    async fn acquire(&self) -> LockResult<LockHandle> {
        self.acquire_with(Timeout::INFINITE, &CancellationToken::new())
            .await
    }
}

/// Counting semaphore: at most [`max_count`](Self::max_count) concurrent holders.
pub trait DistributedSemaphore: DistributedLock {
    /// Maximum number of tickets.
    fn max_count(&self) -> u32;
}

#[async_trait]
impl<L: DistributedLock + ?Sized> DistributedLock for Arc<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        (**self).try_acquire_with(timeout, cancel).await
    }
}

#[async_trait]
impl<L: DistributedLock + ?Sized> DistributedLock for Box<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        (**self).try_acquire_with(timeout, cancel).await
    }
}

/// Factory for named locks on one backend.
pub trait LockProvider: Send + Sync {
    /// Lock type produced by this provider.
    type Lock: DistributedLock;

    /// Create a lock for `name`.
    fn create_lock(&self, name: &str) -> LockResult<Self::Lock>;
}

/// Factory for named semaphores on one backend.
pub trait SemaphoreProvider: Send + Sync {
    /// Semaphore type produced by this provider.
    type Semaphore: DistributedSemaphore;

    /// Create a semaphore for `name` with `max_count` tickets.
    fn create_semaphore(&self, name: &str, max_count: u32) -> LockResult<Self::Semaphore>;
}

/// Scoped acquisition.
#[async_trait]
pub trait DistributedLockExt: DistributedLock {
    /// Acquire, run `body`, and release on every exit path.
    ///
    /// `body` receives the handle's lost token so it can abandon work if the
    /// lock is lost mid-way.
    ///
    /// ```rust,ignore
    /// let total = lock
    ///     .with_lock(Timeout::from_secs(5), &cancel, |lost| async move {
    ///         rebuild_index(lost).await
    ///     })
    ///     .await?;
    /// ```
    async fn with_lock<F, Fut, T>(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
        body: F,
    ) -> LockResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let handle = self.acquire_with(timeout, cancel).await?;
        let output = body(handle.lost_token()).await;
        if let Err(e) = handle.release().await {
            warn!(lock = %self.name(), error = %e, "Failed to release scoped lock");
        }
        Ok(output)
    }
}

impl<L: DistributedLock + ?Sized> DistributedLockExt for L {}

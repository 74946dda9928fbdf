//! Lock handles: the caller-held proof of ownership.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LockResult;
use crate::monitor::LeaseMonitor;

/// Backend-specific release logic, run at most once per handle.
#[async_trait]
pub trait Release: Send + 'static {
    /// Release the lock and clean up any artifact this process created.
    async fn release(self: Box<Self>) -> LockResult<()>;
}

struct HandleState {
    monitor: Option<LeaseMonitor>,
    release: Option<Box<dyn Release>>,
}

/// Handle for a held distributed lock or semaphore ticket.
///
/// Releasing is idempotent and safe to call concurrently: the first call
/// stops the lease monitor and runs the backend release, later calls return
/// `Ok(())` immediately. Dropping an unreleased handle schedules the release
/// on the current tokio runtime.
///
/// The [`lost_token`](Self::lost_token) fires if the backend reports the lock
/// lost while the handle is still held.
pub struct LockHandle {
    name: String,
    lost: CancellationToken,
    released: AtomicBool,
    state: Mutex<HandleState>,
}

impl LockHandle {
    /// Create a handle for an acquired lock.
    pub fn new(name: impl Into<String>, lost: CancellationToken, release: impl Release) -> Self {
        Self {
            name: name.into(),
            lost,
            released: AtomicBool::new(false),
            state: Mutex::new(HandleState {
                monitor: None,
                release: Some(Box::new(release)),
            }),
        }
    }

    /// Attach the lease monitor watching this handle's lease.
    pub fn with_monitor(mut self, monitor: LeaseMonitor) -> Self {
        self.state.get_mut().monitor = Some(monitor);
        self
    }

    /// Name of the lock this handle holds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token fired when the lock is discovered lost while held.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Whether the lock has been reported lost.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Whether [`release`](Self::release) has completed or started.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the lock.
    pub async fn release(&self) -> LockResult<()> {
        let mut state = self.state.lock().await;
        let Some(release) = state.release.take() else {
            return Ok(());
        };
        self.released.store(true, Ordering::Release);

        if let Some(monitor) = state.monitor.take() {
            monitor.stop().await;
        }

        debug!(lock = %self.name, "Releasing lock");
        release.release().await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let Some(release) = state.release.take() else {
            return;
        };
        let monitor = state.monitor.take();
        let name = std::mem::take(&mut self.name);

        // Best effort release on drop
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(monitor) = monitor {
                        monitor.stop().await;
                    }
                    if let Err(e) = release.release().await {
                        warn!(lock = %name, error = %e, "Failed to release dropped lock handle");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %name, "Lock handle dropped outside a tokio runtime; release skipped");
            }
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("lost", &self.is_lost())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct CountingRelease(Arc<AtomicUsize>);

    #[async_trait]
    impl Release for CountingRelease {
        async fn release(self: Box<Self>) -> LockResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = LockHandle::new(
            "test",
            CancellationToken::new(),
            CountingRelease(count.clone()),
        );

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert!(handle.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(LockHandle::new(
            "test",
            CancellationToken::new(),
            CountingRelease(count.clone()),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.release().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = LockHandle::new(
            "test",
            CancellationToken::new(),
            CountingRelease(count.clone()),
        );
        drop(handle);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_token_is_shared() {
        let lost = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = LockHandle::new("test", lost.clone(), CountingRelease(count));

        assert!(!handle.is_lost());
        lost.cancel();
        assert!(handle.is_lost());
        assert!(handle.lost_token().is_cancelled());
    }
}

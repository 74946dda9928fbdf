//! Middleware wrapping lock acquisition.
//!
//! Layers are plain values assembled when the lock is built; the first layer
//! added is the outermost.
//!
//! ```rust,ignore
//! let stats = Arc::new(ContentionStats::default());
//! let lock = InterceptedLock::new(file_lock)
//!     .layer(TracingMiddleware)
//!     .layer(stats.clone());
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::LockResult;
use crate::handle::LockHandle;
use crate::lock::DistributedLock;
use crate::timeout::Timeout;

/// The rest of the acquisition chain.
pub type AcquireFuture<'a> =
    Pin<Box<dyn Future<Output = LockResult<Option<LockHandle>>> + Send + 'a>>;

/// What is being acquired.
#[derive(Debug, Clone)]
pub struct AcquireContext {
    /// Lock name.
    pub name: String,
    /// Requested timeout.
    pub timeout: Timeout,
}

/// A layer around the acquisition call.
#[async_trait]
pub trait AcquireMiddleware: Send + Sync {
    /// Run `next` (the inner layers and the backend), optionally observing or
    /// transforming its outcome.
    async fn around<'a>(
        &'a self,
        context: &'a AcquireContext,
        next: AcquireFuture<'a>,
    ) -> LockResult<Option<LockHandle>>;
}

#[async_trait]
impl<M: AcquireMiddleware + ?Sized> AcquireMiddleware for Arc<M> {
    async fn around<'a>(
        &'a self,
        context: &'a AcquireContext,
        next: AcquireFuture<'a>,
    ) -> LockResult<Option<LockHandle>> {
        (**self).around(context, next).await
    }
}

/// A lock wrapped in an ordered middleware chain.
pub struct InterceptedLock<L> {
    inner: L,
    layers: Vec<Arc<dyn AcquireMiddleware>>,
}

impl<L: DistributedLock> InterceptedLock<L> {
    /// Wrap `inner` with no layers.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            layers: Vec::new(),
        }
    }

    /// Wrap `inner` with a prepared list of layers, outermost first.
    pub fn with_layers(inner: L, layers: Vec<Arc<dyn AcquireMiddleware>>) -> Self {
        Self { inner, layers }
    }

    /// Add a layer inside the existing ones.
    pub fn layer(mut self, middleware: impl AcquireMiddleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// The wrapped lock.
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: DistributedLock> DistributedLock for InterceptedLock<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        let context = AcquireContext {
            name: self.inner.name().to_string(),
            timeout,
        };

        let mut next: AcquireFuture<'_> = Box::pin(self.inner.try_acquire_with(timeout, cancel));
        for layer in self.layers.iter().rev() {
            next = layer.around(&context, next);
        }
        next.await
    }
}

/// Logs each acquisition inside a `lock_acquire` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl AcquireMiddleware for TracingMiddleware {
    async fn around<'a>(
        &'a self,
        context: &'a AcquireContext,
        next: AcquireFuture<'a>,
    ) -> LockResult<Option<LockHandle>> {
        let span = info_span!("lock_acquire", lock = %context.name, timeout = %context.timeout);
        let start = Instant::now();
        let result = next.instrument(span).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(Some(_)) => info!(lock = %context.name, ?elapsed, "Acquired lock"),
            Ok(None) => debug!(lock = %context.name, ?elapsed, "Lock busy"),
            Err(e) => warn!(lock = %context.name, ?elapsed, error = %e, "Lock acquisition failed"),
        }
        result
    }
}

/// Counts acquisition outcomes.
#[derive(Debug, Default)]
pub struct ContentionStats {
    acquired: AtomicU64,
    busy: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ContentionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentionSnapshot {
    pub acquired: u64,
    pub busy: u64,
    pub failed: u64,
}

impl ContentionStats {
    /// Current counters.
    pub fn snapshot(&self) -> ContentionSnapshot {
        ContentionSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AcquireMiddleware for ContentionStats {
    async fn around<'a>(
        &'a self,
        _context: &'a AcquireContext,
        next: AcquireFuture<'a>,
    ) -> LockResult<Option<LockHandle>> {
        let result = next.await;
        let counter = match &result {
            Ok(Some(_)) => &self.acquired,
            Ok(None) => &self.busy,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::handle::Release;
    use std::sync::Mutex;

    struct NoopRelease;

    #[async_trait]
    impl Release for NoopRelease {
        async fn release(self: Box<Self>) -> LockResult<()> {
            Ok(())
        }
    }

    struct ScriptedLock {
        outcomes: Mutex<Vec<LockResult<bool>>>,
    }

    #[async_trait]
    impl DistributedLock for ScriptedLock {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn try_acquire_with(
            &self,
            _timeout: Timeout,
            _cancel: &CancellationToken,
        ) -> LockResult<Option<LockHandle>> {
            let outcome = self.outcomes.lock().unwrap().remove(0);
            Ok(outcome?.then(|| LockHandle::new("scripted", CancellationToken::new(), NoopRelease)))
        }
    }

    /// Records the order layers run in.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AcquireMiddleware for Recorder {
        async fn around<'a>(
            &'a self,
            _context: &'a AcquireContext,
            next: AcquireFuture<'a>,
        ) -> LockResult<Option<LockHandle>> {
            self.log.lock().unwrap().push(format!("enter {}", self.label));
            let result = next.await;
            self.log.lock().unwrap().push(format!("exit {}", self.label));
            result
        }
    }

    #[tokio::test]
    async fn test_layers_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lock = InterceptedLock::new(ScriptedLock {
            outcomes: Mutex::new(vec![Ok(true)]),
        })
        .layer(Recorder {
            label: "outer",
            log: log.clone(),
        })
        .layer(Recorder {
            label: "inner",
            log: log.clone(),
        });

        assert!(lock.try_acquire().await.unwrap().is_some());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter outer", "enter inner", "exit inner", "exit outer"]
        );
    }

    #[tokio::test]
    async fn test_contention_stats() {
        let stats = Arc::new(ContentionStats::default());
        let lock = InterceptedLock::new(ScriptedLock {
            outcomes: Mutex::new(vec![
                Ok(true),
                Ok(false),
                Ok(false),
                Err(LockError::Backend("down".into())),
            ]),
        })
        .layer(TracingMiddleware)
        .layer(stats.clone());

        for _ in 0..4 {
            let _ = lock.try_acquire().await;
        }

        assert_eq!(
            stats.snapshot(),
            ContentionSnapshot {
                acquired: 1,
                busy: 2,
                failed: 1,
            }
        );
    }
}

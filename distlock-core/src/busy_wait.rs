//! Busy-wait acquisition engine.
//!
//! Backends without a native blocking wait hand a single-attempt function to
//! [`busy_wait`], which retries it with jittered sleeps until it succeeds, the
//! timeout elapses or the caller cancels.
//!
//! ## Example
//!
//! ```rust,ignore
//! use distlock_core::{busy_wait, BusyWaitConfig, Timeout};
//!
//! let handle = busy_wait(&BusyWaitConfig::default(), Timeout::from_secs(5), &cancel, |token| {
//!     backend.try_acquire_once(token)
//! })
//! .await?;
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::trace;

use crate::config::BusyWaitConfig;
use crate::error::{LockError, LockResult};
use crate::timeout::Timeout;

/// Retry `attempt` until it yields a value, the timeout elapses or `cancel` fires.
///
/// Returns `Ok(None)` on timeout and `Err(LockError::Cancelled)` when the
/// caller's token fired. `attempt` receives the token it should honor: the
/// caller's own token for the first and last attempts, a token that also
/// fires at the deadline for the ones in between.
pub async fn busy_wait<T, F, Fut>(
    config: &BusyWaitConfig,
    timeout: Timeout,
    cancel: &CancellationToken,
    mut attempt: F,
) -> LockResult<Option<T>>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = LockResult<Option<T>>>,
{
    if cancel.is_cancelled() {
        return Err(LockError::Cancelled);
    }

    if let Some(acquired) = attempt(cancel.clone()).await? {
        return Ok(Some(acquired));
    }
    if timeout.is_zero() {
        return Ok(None);
    }

    let merged = cancel.child_token();
    let _timer = timeout.duration().map(|duration| {
        let merged = merged.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            merged.cancel();
        }))
    });

    loop {
        let nap = sleep_interval(config.min_sleep, config.max_sleep);
        trace!(?nap, "Lock busy, sleeping before next attempt");
        tokio::select! {
            _ = merged.cancelled() => break,
            _ = tokio::time::sleep(nap) => {}
        }

        match attempt(merged.clone()).await {
            Ok(Some(acquired)) => return Ok(Some(acquired)),
            Ok(None) => {
                if merged.is_cancelled() {
                    break;
                }
            }
            Err(LockError::Cancelled) if merged.is_cancelled() => break,
            Err(e) => return Err(e),
        }
    }

    if cancel.is_cancelled() {
        return Err(LockError::Cancelled);
    }

    // The deadline fired; the resource may have freed up right at the boundary.
    attempt(cancel.clone()).await
}

/// Pick a sleep uniformly from `[min, max]`.
pub fn sleep_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn config() -> BusyWaitConfig {
        BusyWaitConfig::new(Duration::from_millis(10), Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn test_sleep_interval_bounds() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(20);
        for _ in 0..100 {
            let nap = sleep_interval(min, max);
            assert!(nap >= min && nap <= max);
        }
        assert_eq!(sleep_interval(max, min), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_sleeps() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Option<()> = busy_wait(&config(), Timeout::ZERO, &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = AtomicUsize::new(0);
        let result = busy_wait(&config(), Timeout::INFINITE, &CancellationToken::new(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 3 { Some(n) } else { None }) }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_none_after_final_attempt() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Option<()> =
            busy_wait(&config(), Timeout::from_secs(1), &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed <= Duration::from_millis(1050));
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_catches_boundary_release() {
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let result = busy_wait(&config(), Timeout::from_millis(200), &cancel, move |token| {
            // Succeeds only once the deadline passed and only on a live token,
            // which after the deadline is the caller's own.
            let ready = start.elapsed() >= Duration::from_millis(200) && !token.is_cancelled();
            async move { Ok(ready.then_some("acquired")) }
        })
        .await
        .unwrap();

        assert_eq!(result, Some("acquired"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_is_not_a_timeout() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: LockResult<Option<()>> =
            busy_wait(&config(), Timeout::from_secs(10), &cancel, |_| async { Ok(None) }).await;

        assert!(matches!(result, Err(LockError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: LockResult<Option<()>> =
            busy_wait(&config(), Timeout::INFINITE, &cancel, |_| async { Ok(Some(())) }).await;
        assert!(matches!(result, Err(LockError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_errors_propagate() {
        let calls = AtomicUsize::new(0);
        let result: LockResult<Option<()>> =
            busy_wait(&config(), Timeout::INFINITE, &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 2 {
                        Err(LockError::Backend("boom".into()))
                    } else {
                        Ok(None)
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(LockError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

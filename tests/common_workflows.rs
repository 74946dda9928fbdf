//! Integration tests for common distlock workflows.
//!
//! These tests run the same caller-facing scenarios against every backend.

use distlock::prelude::*;
use distlock::{ContentionStats, Reap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Shared scenarios
// =============================================================================

/// Two locks on one name: the second probe is busy until the first releases.
async fn exclusive_round_trip<L: DistributedLock>(first: L, second: L) {
    let handle = first.try_acquire().await.unwrap().expect("first acquisition");
    assert!(second.try_acquire().await.unwrap().is_none());

    let err = second
        .acquire_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    handle.release().await.unwrap();
    handle.release().await.unwrap();

    let handle = second.try_acquire().await.unwrap().expect("free after release");
    handle.release().await.unwrap();
}

/// Four tasks incrementing a counter under the lock never overlap.
async fn serialized_section<P>(provider: Arc<P>)
where
    P: LockProvider + 'static,
    P::Lock: 'static,
{
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let lock = provider.create_lock("shared-section").unwrap();
        let inside = inside.clone();
        let total = total.clone();
        tasks.push(tokio::spawn(async move {
            lock.with_lock(Timeout::from_secs(10), &CancellationToken::new(), |_| async {
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                total.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 4);
}

/// A pre-cancelled token fails fast without touching the backend.
async fn cancelled_before_start<L: DistributedLock>(lock: L) {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = lock.try_acquire_with(Timeout::INFINITE, &cancel).await;
    assert!(matches!(result, Err(LockError::Cancelled)));
}

// =============================================================================
// File backend
// =============================================================================

#[tokio::test]
async fn test_file_backend_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FileLockProvider::new(FileLockConfig::new(dir.path())).unwrap());

    exclusive_round_trip(
        provider.create_lock("report").unwrap(),
        provider.create_lock("report").unwrap(),
    )
    .await;
    serialized_section(provider.clone()).await;
    cancelled_before_start(provider.create_lock("report").unwrap()).await;
}

// =============================================================================
// Blob lease backend
// =============================================================================

#[tokio::test]
async fn test_blob_backend_workflows() {
    let store = Arc::new(InMemoryBlobStore::new());
    let config = BlobLeaseConfig::new("locks").with_busy_wait(
        BusyWaitConfig::new(Duration::from_millis(5), Duration::from_millis(20)).unwrap(),
    );
    let provider = Arc::new(BlobLeaseProvider::new(store.clone(), config).unwrap());

    exclusive_round_trip(
        provider.create_lock("report").unwrap(),
        provider.create_lock("report").unwrap(),
    )
    .await;
    serialized_section(provider.clone()).await;
    cancelled_before_start(provider.create_lock("report").unwrap()).await;

    // Every lock blob was created on demand and cleaned up again.
    assert!(store.is_empty());
}

// =============================================================================
// Ensemble backend
// =============================================================================

#[tokio::test]
async fn test_ensemble_backend_workflows() {
    let ensemble = InMemoryEnsemble::new();
    let config = ZooKeeperConfig::new("zk1:2181").unwrap();
    let provider = Arc::new(ZooKeeperProvider::new(Arc::new(ensemble.clone()), config).unwrap());

    exclusive_round_trip(
        provider.create_lock("report").unwrap(),
        provider.create_lock("report").unwrap(),
    )
    .await;
    serialized_section(provider.clone()).await;
    cancelled_before_start(provider.create_lock("report").unwrap()).await;

    assert!(ensemble.children("/distlock/report").is_empty());
    assert_eq!(ensemble.connect_count(), 1);
}

#[tokio::test]
async fn test_ensemble_semaphore_through_provider_trait() {
    let ensemble = InMemoryEnsemble::new();
    let config = ZooKeeperConfig::new("zk1:2181").unwrap();
    let provider = ZooKeeperProvider::new(Arc::new(ensemble), config).unwrap();

    let semaphore = provider.create_semaphore("slots", 3).unwrap();
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(semaphore.try_acquire().await.unwrap().unwrap());
    }
    assert!(semaphore.try_acquire().await.unwrap().is_none());
    for handle in handles {
        handle.release().await.unwrap();
    }
}

// =============================================================================
// Middleware and reaping
// =============================================================================

#[tokio::test]
async fn test_middleware_counts_contention() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileLockProvider::new(FileLockConfig::new(dir.path())).unwrap();
    let stats = Arc::new(ContentionStats::default());

    let first = InterceptedLock::new(provider.create_lock("audited").unwrap())
        .layer(TracingMiddleware)
        .layer(stats.clone());
    let second = InterceptedLock::new(provider.create_lock("audited").unwrap()).layer(stats.clone());

    let handle = first.acquire().await.unwrap();
    assert!(second.try_acquire().await.unwrap().is_none());
    handle.release().await.unwrap();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.acquired, 1);
    assert_eq!(snapshot.busy, 1);
    assert_eq!(snapshot.failed, 0);
}

#[tokio::test]
async fn test_file_reaper_leaves_held_locks() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileLockProvider::new(FileLockConfig::new(dir.path())).unwrap();
    let handle = provider.create_lock("held").unwrap().acquire().await.unwrap();

    let reaper = distlock::distlock_file::FileLockReaper::new(dir.path());
    assert_eq!(reaper.reap(Duration::ZERO).await.unwrap(), 0);

    handle.release().await.unwrap();
}

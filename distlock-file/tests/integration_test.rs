//! Integration tests for distlock-file

use distlock_core::{
    BusyWaitConfig, CancellationToken, DistributedLock, DistributedLockExt, LockError,
    LockProvider, Timeout,
};
use distlock_file::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn provider(dir: &std::path::Path) -> FileLockProvider {
    let config = FileLockConfig::builder(dir)
        .busy_wait(BusyWaitConfig::new(Duration::from_millis(5), Duration::from_millis(25)).unwrap())
        .build()
        .unwrap();
    FileLockProvider::new(config).unwrap()
}

#[tokio::test]
async fn test_acquire_times_out_while_held() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());
    let first = provider.create_lock("report").unwrap();
    let second = provider.create_lock("report").unwrap();

    let handle = first.acquire().await.unwrap();

    let err = second
        .acquire_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    handle.release().await.unwrap();
    let handle = second.acquire_timeout(Duration::from_secs(5)).await.unwrap();
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_waiter_gets_lock_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());
    let first = provider.create_lock("queue").unwrap();
    let second = provider.create_lock("queue").unwrap();

    let handle = first.acquire().await.unwrap();
    let waiter = tokio::spawn(async move { second.acquire_timeout(Duration::from_secs(10)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.release().await.unwrap();

    let handle = waiter.await.unwrap().unwrap();
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_mutual_exclusion() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let lock = provider.create_lock("counter").unwrap();
        let inside = inside.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                lock.with_lock(Timeout::INFINITE, &CancellationToken::new(), |_| {
                    let inside = inside.clone();
                    let peak = peak.clone();
                    async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_while_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());
    let first = provider.create_lock("cancel-me").unwrap();
    let second = provider.create_lock("cancel-me").unwrap();
    let _handle = first.acquire().await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = second.try_acquire_with(Timeout::INFINITE, &cancel).await;
    assert!(matches!(result, Err(LockError::Cancelled)));
}

#[tokio::test]
async fn test_odd_names_map_to_distinct_files() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());

    let slash = provider.create_lock("tenant/42").unwrap();
    let underscore = provider.create_lock("tenant_42").unwrap();
    assert_ne!(slash.path(), underscore.path());
    assert_eq!(slash.path().parent(), Some(dir.path()));

    let a = slash.try_acquire().await.unwrap().unwrap();
    let b = underscore.try_acquire().await.unwrap().unwrap();
    a.release().await.unwrap();
    b.release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_handle_releases() {
    let dir = tempfile::tempdir().unwrap();
    let provider = provider(dir.path());
    let lock = provider.create_lock("dropped").unwrap();

    drop(lock.try_acquire().await.unwrap().unwrap());

    let handle = lock.acquire_timeout(Duration::from_secs(5)).await.unwrap();
    handle.release().await.unwrap();
}

#[test]
fn test_provider_from_lookup_config() {
    let config = FileLockConfig::from_lookup(|key| match key {
        "DISTLOCK_FILE_DIR" => Some("/tmp/distlock".to_string()),
        _ => None,
    })
    .unwrap();
    let provider = FileLockProvider::new(config).unwrap();
    let lock = provider.create_lock("x").unwrap();
    assert_eq!(lock.path(), std::path::Path::new("/tmp/distlock/x.lock"));
}

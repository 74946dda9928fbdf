//! Removal of lock files left behind by crashed holders.

use async_trait::async_trait;
use distlock_core::{LockResult, Reap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

use crate::lock::{LOCK_FILE_EXTENSION, open_and_lock};

/// Sweeps a lock directory for stale, unheld `*.lock` files.
///
/// A file is removed only if it is older than the grace period and can be
/// locked right now, so a live holder is never disturbed.
#[derive(Debug, Clone)]
pub struct FileLockReaper {
    directory: PathBuf,
}

impl FileLockReaper {
    /// Create a reaper for `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Directory being swept.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl Reap for FileLockReaper {
    async fn reap(&self, grace: Duration) -> LockResult<usize> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || sweep(&directory, grace)).await?
    }
}

fn sweep(directory: &Path, grace: Duration) -> LockResult<usize> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != LOCK_FILE_EXTENSION) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < grace {
            trace!(path = %path.display(), ?age, "Lock file too young to reap");
            continue;
        }

        // Only a file nobody holds is abandoned.
        match open_and_lock(&path) {
            Ok(Some(file)) => {
                if fs::remove_file(&path).is_ok() {
                    debug!(path = %path.display(), ?age, "Reaped abandoned lock file");
                    removed += 1;
                }
                drop(file);
            }
            Ok(None) => trace!(path = %path.display(), "Lock file is held"),
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping lock file"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileDistributedLock;
    use distlock_core::DistributedLock;

    #[tokio::test]
    async fn test_reaps_only_unheld_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stale.lock"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let held = FileDistributedLock::new(dir.path(), "held").unwrap();
        let handle = held.try_acquire().await.unwrap().unwrap();

        let reaper = FileLockReaper::new(dir.path());
        let removed = reaper.reap(Duration::ZERO).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("stale.lock").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(held.path().exists());

        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_grace_period_protects_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fresh.lock"), b"").unwrap();

        let reaper = FileLockReaper::new(dir.path());
        assert_eq!(reaper.reap(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(dir.path().join("fresh.lock").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reaper = FileLockReaper::new(dir.path().join("absent"));
        assert_eq!(reaper.reap(Duration::ZERO).await.unwrap(), 0);
    }
}

//! Background cleanup of abandoned lock artifacts.
//!
//! Handles release their artifacts on every normal exit path. A process that
//! crashes while holding a lock can still leave one behind (a lock file, a
//! marked blob); a [`Reaper`] periodically asks the backend to remove those
//! older than a grace period.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LockResult;

/// Backend sweep for abandoned artifacts.
#[async_trait]
pub trait Reap: Send + Sync + 'static {
    /// Delete unheld artifacts older than `grace`; returns how many were removed.
    async fn reap(&self, grace: Duration) -> LockResult<usize>;
}

/// Reaper timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Minimum artifact age before it is considered abandoned.
    pub grace: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace: Duration::from_secs(3600),
        }
    }
}

/// Periodic sweep task.
pub struct Reaper {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Start sweeping `target` every `config.interval`.
    pub fn start(target: Arc<dyn Reap>, config: ReaperConfig) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            info!(interval = ?config.interval, grace = ?config.grace, "Starting lock reaper");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.interval) => {}
                }
                match target.reap(config.grace).await {
                    Ok(0) => debug!("Reaper sweep found nothing"),
                    Ok(removed) => info!(removed, "Reaped abandoned lock artifacts"),
                    Err(e) => warn!(error = %e, "Reaper sweep failed"),
                }
            }
        });
        Self { stop, task }
    }

    /// Stop sweeping and wait for the task to end.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

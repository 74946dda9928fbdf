//! Lease monitoring: background renewal and loss detection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LockError, LockResult};

/// Outcome of one renew-or-validate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Lease validated but not renewed.
    Held,
    /// Lease renewed; the lifetime clock restarts.
    Renewed,
    /// Lease is gone.
    Lost,
    /// Transient failure; try again next cycle.
    Unknown,
}

/// Backend operation invoked by the monitor every cadence.
#[async_trait]
pub trait LeaseRenewer: Send + Sync + 'static {
    /// Renew the lease, or just check it is still held.
    ///
    /// `cancel` fires when the monitor is stopping.
    async fn renew_or_validate(&self, cancel: &CancellationToken) -> LeaseState;
}

/// Lease timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    duration: Option<Duration>,
    cadence: Duration,
}

impl Lease {
    /// Create a finite lease checked every `cadence`.
    pub fn new(duration: Duration, cadence: Duration) -> LockResult<Self> {
        if cadence.is_zero() {
            return Err(LockError::Config("monitoring cadence must be positive".into()));
        }
        if cadence > duration {
            return Err(LockError::Config(format!(
                "monitoring cadence {:?} exceeds lease duration {:?}",
                cadence, duration
            )));
        }
        Ok(Self {
            duration: Some(duration),
            cadence,
        })
    }

    /// Create a lease that never expires on its own.
    pub fn infinite(cadence: Duration) -> LockResult<Self> {
        if cadence.is_zero() {
            return Err(LockError::Config("monitoring cadence must be positive".into()));
        }
        Ok(Self {
            duration: None,
            cadence,
        })
    }

    /// Lease duration, `None` when infinite.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Monitoring cadence.
    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Whether the lease expires on its own.
    pub fn is_infinite(&self) -> bool {
        self.duration.is_none()
    }
}

/// Background watchdog for a held lease.
///
/// The task holds the renewer for its whole lifetime; [`stop`](Self::stop) is
/// the only way to end it early.
pub struct LeaseMonitor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseMonitor {
    /// Start monitoring. `lost` fires once if the lease is lost.
    pub fn start(
        name: impl Into<String>,
        lease: Lease,
        renewer: Arc<dyn LeaseRenewer>,
        lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(name.into(), lease, renewer, lost, stop.clone()));
        Self { stop, task }
    }

    /// Whether the monitoring loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to end.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            warn!(error = %e, "Lease monitor task panicked");
        }
    }
}

async fn run(
    name: String,
    lease: Lease,
    renewer: Arc<dyn LeaseRenewer>,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    let mut renewed_at = Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(lease.cadence) => {}
        }

        if let Some(duration) = lease.duration
            && renewed_at.elapsed() > duration
        {
            warn!(lock = %name, ?duration, "Lease expired before it could be renewed");
            signal_lost(lost);
            return;
        }

        let state = renewer.renew_or_validate(&stop).await;
        if stop.is_cancelled() {
            return;
        }

        match state {
            LeaseState::Renewed => {
                debug!(lock = %name, "Lease renewed");
                renewed_at = Instant::now();
            }
            LeaseState::Held => {}
            LeaseState::Unknown => {
                debug!(lock = %name, "Lease state unknown, retrying next cycle");
            }
            LeaseState::Lost => {
                warn!(lock = %name, "Lease lost");
                signal_lost(lost);
                return;
            }
        }
    }
}

// Fired from its own task so reactions to the token never run on the
// monitoring loop.
fn signal_lost(lost: CancellationToken) {
    tokio::spawn(async move { lost.cancel() });
}

//! Distributed Lock Core for distlock
//!
//! This crate provides the backend-independent half of distlock: the lock
//! contract, handles, the busy-wait engine and the lease monitor. Backends
//! live in `distlock-file`, `distlock-azure` and `distlock-zookeeper`.
//!
//! ## Features
//!
//! - **One contract** - [`DistributedLock`] / [`DistributedSemaphore`] behave
//!   the same on every backend
//! - **Busy-wait engine** - jittered polling with timeout and cancellation
//! - **Lease monitor** - background renewal and loss detection
//! - **Idempotent handles** - release once, from anywhere, or on drop
//! - **Middleware** - tracing and contention stats around acquisition
//! - **Reaper** - background sweep for artifacts left by crashed holders
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use distlock_core::*;
//! use std::time::Duration;
//!
//! async fn run(lock: impl DistributedLock) -> LockResult<()> {
//!     // Probe once
//!     if let Some(handle) = lock.try_acquire().await? {
//!         handle.release().await?;
//!     }
//!
//!     // Wait up to five seconds
//!     let handle = lock.acquire_timeout(Duration::from_secs(5)).await?;
//!
//!     // React if the lease is lost mid-way
//!     let lost = handle.lost_token();
//!     tokio::select! {
//!         _ = lost.cancelled() => println!("lock lost, aborting"),
//!         _ = do_work() => {}
//!     }
//!
//!     handle.release().await
//! }
//! ```

pub mod busy_wait;
pub mod config;
pub mod error;
pub mod handle;
pub mod lock;
pub mod middleware;
pub mod monitor;
pub mod naming;
pub mod reaper;
pub mod timeout;

pub use busy_wait::{busy_wait, sleep_interval};
pub use config::BusyWaitConfig;
pub use error::{LockError, LockResult};
pub use handle::{LockHandle, Release};
pub use lock::{
    DistributedLock, DistributedLockExt, DistributedSemaphore, LockProvider, SemaphoreProvider,
};
pub use middleware::{
    AcquireContext, AcquireFuture, AcquireMiddleware, ContentionSnapshot, ContentionStats,
    InterceptedLock, TracingMiddleware,
};
pub use monitor::{Lease, LeaseMonitor, LeaseRenewer, LeaseState};
pub use naming::to_safe_name;
pub use reaper::{Reap, Reaper, ReaperConfig};
pub use timeout::Timeout;

pub use tokio_util::sync::CancellationToken;

//! File-system backend for distlock
//!
//! A lock is an exclusive OS lock on a file named after the lock. Any
//! process that can reach the same directory (local disk or a shared mount
//! with working byte-range locks) contends for it.
//!
//! ## Features
//!
//! - **Exclusive lock files** - `flock`/`LockFileEx` through `fs2`
//! - **Safe names** - arbitrary lock names mapped to valid, collision-free
//!   file names
//! - **Self-cleaning** - lock files are deleted on release; a
//!   [`FileLockReaper`] removes any left by crashed processes
//! - **Racy-FS tolerant** - transient "access denied" errors during
//!   concurrent create/delete are retried up to a configurable budget
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use distlock_core::{DistributedLock, LockProvider};
//! use distlock_file::{FileLockConfig, FileLockProvider};
//! use std::time::Duration;
//!
//! let provider = FileLockProvider::new(FileLockConfig::new("/var/lock/myapp"))?;
//! let lock = provider.create_lock("nightly-report")?;
//!
//! if let Some(handle) = lock.try_acquire().await? {
//!     generate_report().await;
//!     handle.release().await?;
//! }
//! ```

pub mod config;
pub mod lock;
pub mod provider;
pub mod reaper;

pub use config::{FileLockConfig, FileLockConfigBuilder, FileLockOptions};
pub use lock::{FileDistributedLock, lock_file_name};
pub use provider::FileLockProvider;
pub use reaper::FileLockReaper;

//! Coordination ensemble backend for distlock
//!
//! Locks are queues of ephemeral-sequential nodes under a per-lock path.
//! Acquisition order follows the ensemble's sequence numbers, waiters watch
//! the node in their way instead of polling, and a crashed holder's node
//! disappears with its session.
//!
//! ## Features
//!
//! - **Exclusive locks** - [`ZooKeeperDistributedLock`]
//! - **Semaphores** - [`ZooKeeperDistributedSemaphore`], up to N holders
//! - **Reader-writer locks** - [`ZooKeeperDistributedReaderWriterLock`]
//! - **Session pool** - locks with equal connection parameters share one
//!   session, recycled after a maximum age or on connection loss
//! - **Pluggable ensemble** - [`EnsembleConnector`] / [`EnsembleSession`]
//!   traits with an in-memory implementation and a ZooKeeper one
//!   (`zookeeper` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use distlock_core::{DistributedLock, LockProvider};
//! use distlock_zookeeper::{InMemoryEnsemble, ZooKeeperConfig, ZooKeeperProvider};
//! use std::sync::Arc;
//!
//! let config = ZooKeeperConfig::new("zk1:2181,zk2:2181")?;
//! let provider = ZooKeeperProvider::new(Arc::new(InMemoryEnsemble::new()), config)?;
//! let lock = provider.create_lock("inventory")?;
//!
//! let handle = lock.acquire().await?;
//! // Critical section
//! handle.release().await?;
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod node;
pub mod path;
pub mod pool;
pub mod provider;
pub mod rw_lock;
pub mod semaphore;
pub mod session;

#[cfg(feature = "zookeeper")]
pub mod client;

pub use config::{
    Acl, AuthInfo, ConnectionParams, ZooKeeperConfig, ZooKeeperConfigBuilder, ZooKeeperOptions,
    perms,
};
pub use error::{EnsembleError, EnsembleResult};
pub use lock::ZooKeeperDistributedLock;
pub use memory::InMemoryEnsemble;
pub use node::{ACQUIRED_MARKER, NodePolicy};
pub use pool::{PooledSession, SessionPool};
pub use provider::ZooKeeperProvider;
pub use rw_lock::{ZooKeeperDistributedReaderWriterLock, ZooKeeperReadLock, ZooKeeperWriteLock};
pub use semaphore::ZooKeeperDistributedSemaphore;
pub use session::{
    CreateMode, EnsembleConnector, EnsembleSession, Stat, WatchEventKind, WatchedEvent,
};

#[cfg(feature = "zookeeper")]
pub use client::ZooKeeperConnector;

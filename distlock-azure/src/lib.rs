//! Blob lease backend for distlock
//!
//! A lock is a lease on a blob. Holding the lease means holding the lock; a
//! background monitor renews it and fires the handle's lost token if it is
//! broken or stolen.
//!
//! ## Features
//!
//! - **On-demand blobs** - missing lock blobs are created with a creation
//!   marker and deleted again on release
//! - **Pre-existing blobs** - any blob can serve as a lock; it is only leased
//! - **Lease monitor** - renewal at a configurable cadence, or validation only
//! - **Pluggable store** - [`BlobStore`] trait with an in-memory
//!   implementation and an Azure Blob Storage one (`azure` feature)
//! - **Reaper** - removes marked blobs abandoned by crashed holders
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use distlock_azure::{BlobLeaseConfig, BlobLeaseProvider, InMemoryBlobStore};
//! use distlock_core::{DistributedLock, LockProvider};
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryBlobStore::new());
//! let provider = BlobLeaseProvider::new(store, BlobLeaseConfig::new("locks"))?;
//! let lock = provider.create_lock("billing-run")?;
//!
//! let handle = lock.acquire().await?;
//! // Critical section
//! handle.release().await?;
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod provider;
pub mod reaper;
pub mod store;

#[cfg(feature = "azure")]
pub mod azure;

pub use config::{BlobLeaseConfig, BlobLeaseOptions};
pub use error::{BlobStoreError, BlobStoreResult};
pub use lock::{BlobLeaseDistributedLock, blob_name, prefixed_blob_name};
pub use memory::InMemoryBlobStore;
pub use provider::BlobLeaseProvider;
pub use reaper::BlobLeaseReaper;
pub use store::{BlobInfo, BlobMetadata, BlobStore, CREATED_MARKER_KEY, MAX_BLOB_NAME_LEN};

#[cfg(feature = "azure")]
pub use azure::{AzureBlobStore, AzureBlobStoreConfig};

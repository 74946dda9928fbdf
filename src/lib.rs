// distlock - Distributed locks and semaphores for Rust
//
// This library provides cross-process mutual exclusion and counting
// semaphores over file-system, blob lease, and coordination ensemble backends.

// Re-export core functionality
pub use distlock_core::*;

// Re-export backend crates
#[cfg(feature = "file")]
pub use distlock_file;

#[cfg(feature = "azure")]
pub use distlock_azure;

#[cfg(feature = "zookeeper")]
pub use distlock_zookeeper;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BusyWaitConfig,
        CancellationToken,
        DistributedLock,
        DistributedLockExt,
        DistributedSemaphore,
        InterceptedLock,
        LockError,
        LockHandle,
        LockProvider,
        LockResult,
        Reaper,
        ReaperConfig,
        SemaphoreProvider,
        Timeout,
        TracingMiddleware,
    };

    #[cfg(feature = "file")]
    pub use distlock_file::{FileDistributedLock, FileLockConfig, FileLockProvider};

    #[cfg(feature = "azure")]
    pub use distlock_azure::{
        BlobLeaseConfig, BlobLeaseDistributedLock, BlobLeaseProvider, BlobStore,
        InMemoryBlobStore,
    };

    #[cfg(feature = "zookeeper")]
    pub use distlock_zookeeper::{
        InMemoryEnsemble, ZooKeeperConfig, ZooKeeperDistributedLock,
        ZooKeeperDistributedReaderWriterLock, ZooKeeperDistributedSemaphore, ZooKeeperProvider,
    };

    #[cfg(feature = "zookeeper-client")]
    pub use distlock_zookeeper::ZooKeeperConnector;
}

//! Lock factory over one directory.

use distlock_core::{LockProvider, LockResult};
use std::path::Path;

use crate::config::FileLockConfig;
use crate::lock::FileDistributedLock;

/// Creates [`FileDistributedLock`]s inside a configured directory.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    config: FileLockConfig,
}

impl FileLockProvider {
    /// Create a provider from a configuration.
    pub fn new(config: FileLockConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a provider from `DISTLOCK_FILE_*` environment variables.
    pub fn from_env() -> LockResult<Self> {
        Self::new(FileLockConfig::from_env()?)
    }

    /// Directory the locks live in.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// The provider's configuration.
    pub fn config(&self) -> &FileLockConfig {
        &self.config
    }
}

impl LockProvider for FileLockProvider {
    type Lock = FileDistributedLock;

    fn create_lock(&self, name: &str) -> LockResult<FileDistributedLock> {
        FileDistributedLock::with_options(&self.config.directory, name, self.config.options)
    }
}

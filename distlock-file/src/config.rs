//! File lock configuration.

use distlock_core::config::{env_lookup, parsed_var};
use distlock_core::{BusyWaitConfig, LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable for the lock directory.
pub const ENV_DIRECTORY: &str = "DISTLOCK_FILE_DIR";
/// Environment variable for the permission-error retry budget.
pub const ENV_PERMISSION_RETRIES: &str = "DISTLOCK_FILE_PERMISSION_RETRIES";

/// Per-lock tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLockOptions {
    /// How many transient permission errors one attempt tolerates.
    ///
    /// Creating a directory or opening a file can fail with "access denied"
    /// while another process is creating or deleting the same path. The right
    /// budget depends on the file system, so it is a tuning knob.
    #[serde(default = "default_permission_retries")]
    pub max_permission_retries: u32,
    /// Busy-wait sleep bounds.
    #[serde(default)]
    pub busy_wait: BusyWaitConfig,
}

fn default_permission_retries() -> u32 {
    400
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self {
            max_permission_retries: default_permission_retries(),
            busy_wait: BusyWaitConfig::default(),
        }
    }
}

impl FileLockOptions {
    /// Check the options.
    pub fn validate(&self) -> LockResult<()> {
        self.busy_wait.validate()
    }
}

/// File lock provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLockConfig {
    /// Directory holding the lock files.
    pub directory: PathBuf,
    /// Per-lock tuning.
    #[serde(flatten)]
    pub options: FileLockOptions,
}

impl FileLockConfig {
    /// Create a configuration for a directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            options: FileLockOptions::default(),
        }
    }

    /// Create a builder.
    pub fn builder(directory: impl Into<PathBuf>) -> FileLockConfigBuilder {
        FileLockConfigBuilder::new(directory)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> LockResult<Self> {
        Self::from_lookup(env_lookup)
    }

    /// Load configuration through `lookup` (environment-style keys).
    pub fn from_lookup<F>(lookup: F) -> LockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let directory = lookup(ENV_DIRECTORY)
            .ok_or_else(|| LockError::Config(format!("{} is not set", ENV_DIRECTORY)))?;

        let mut config = Self::new(directory);
        if let Some(retries) = parsed_var(&lookup, ENV_PERMISSION_RETRIES)? {
            config.options.max_permission_retries = retries;
        }
        config.options.busy_wait = config.options.busy_wait.from_lookup(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    pub fn validate(&self) -> LockResult<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(LockError::Config("lock directory must not be empty".into()));
        }
        self.options.validate()
    }
}

/// Builder for [`FileLockConfig`].
pub struct FileLockConfigBuilder {
    config: FileLockConfig,
}

impl FileLockConfigBuilder {
    /// Create a new builder.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            config: FileLockConfig::new(directory),
        }
    }

    /// Set the permission-error retry budget.
    pub fn max_permission_retries(mut self, retries: u32) -> Self {
        self.config.options.max_permission_retries = retries;
        self
    }

    /// Set the busy-wait sleep bounds.
    pub fn busy_wait(mut self, busy_wait: BusyWaitConfig) -> Self {
        self.config.options.busy_wait = busy_wait;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> LockResult<FileLockConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

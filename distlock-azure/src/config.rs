//! Blob lease configuration.

use distlock_core::config::{duration_var, env_lookup};
use distlock_core::{BusyWaitConfig, Lease, LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::{MAX_LEASE_DURATION, MIN_LEASE_DURATION};

/// Environment variable for the container holding lock blobs.
pub const ENV_CONTAINER: &str = "DISTLOCK_BLOB_CONTAINER";
/// Environment variable for the lease duration (`"30s"` or `"infinite"`).
pub const ENV_LEASE_DURATION: &str = "DISTLOCK_BLOB_LEASE_DURATION";
/// Environment variable for the renewal cadence (`"10s"` or `"infinite"` to disable).
pub const ENV_RENEWAL_CADENCE: &str = "DISTLOCK_BLOB_RENEWAL_CADENCE";

const INFINITE: &str = "infinite";

/// Per-lock lease tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLeaseOptions {
    /// Lease duration; `None` requests an infinite lease.
    #[serde(with = "humantime_serde", default = "default_lease_duration")]
    pub lease_duration: Option<Duration>,
    /// How often the monitor renews (or validates) the lease.
    ///
    /// Defaults to a third of the lease duration.
    #[serde(with = "humantime_serde", default)]
    pub renewal_cadence: Option<Duration>,
    /// Renew the lease automatically. When off, the monitor only validates it.
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
    /// Busy-wait sleep bounds.
    #[serde(default)]
    pub busy_wait: BusyWaitConfig,
}

fn default_lease_duration() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_auto_renew() -> bool {
    true
}

impl Default for BlobLeaseOptions {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            renewal_cadence: None,
            auto_renew: default_auto_renew(),
            busy_wait: BusyWaitConfig::default(),
        }
    }
}

impl BlobLeaseOptions {
    /// Check the options.
    pub fn validate(&self) -> LockResult<()> {
        self.lease()?;
        self.busy_wait.validate()
    }

    /// Monitoring cadence after defaults are applied.
    pub fn effective_cadence(&self) -> Duration {
        self.renewal_cadence.unwrap_or(match self.lease_duration {
            Some(duration) => duration / 3,
            None => MIN_LEASE_DURATION,
        })
    }

    /// Whether the monitor renews the lease.
    ///
    /// Infinite leases never need renewal.
    pub fn renews(&self) -> bool {
        self.auto_renew && self.lease_duration.is_some()
    }

    /// Lease timing for the monitor.
    pub fn lease(&self) -> LockResult<Lease> {
        let cadence = self.effective_cadence();
        match self.lease_duration {
            Some(duration) => {
                if !(MIN_LEASE_DURATION..=MAX_LEASE_DURATION).contains(&duration) {
                    return Err(LockError::Config(format!(
                        "lease duration {:?} must be between {:?} and {:?} or infinite",
                        duration, MIN_LEASE_DURATION, MAX_LEASE_DURATION
                    )));
                }
                if cadence >= duration {
                    return Err(LockError::Config(format!(
                        "renewal cadence {:?} must be shorter than the lease duration {:?}",
                        cadence, duration
                    )));
                }
                Lease::new(duration, cadence)
            }
            None => Lease::infinite(cadence),
        }
    }

    /// Override settings from `DISTLOCK_BLOB_*` / `DISTLOCK_BUSY_WAIT_*` variables.
    pub fn from_lookup<F>(mut self, lookup: F) -> LockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(ENV_LEASE_DURATION).as_deref().map(str::trim) {
            Some(INFINITE) => self.lease_duration = None,
            Some(_) => self.lease_duration = duration_var(&lookup, ENV_LEASE_DURATION)?,
            None => {}
        }
        match lookup(ENV_RENEWAL_CADENCE).as_deref().map(str::trim) {
            Some(INFINITE) => self.auto_renew = false,
            Some(_) => self.renewal_cadence = duration_var(&lookup, ENV_RENEWAL_CADENCE)?,
            None => {}
        }
        self.busy_wait = self.busy_wait.from_lookup(&lookup)?;
        self.validate()?;
        Ok(self)
    }
}

/// Blob lease provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLeaseConfig {
    /// Container holding the lock blobs.
    pub container: String,
    /// Prefix prepended to every lock blob name.
    #[serde(default)]
    pub prefix: String,
    /// Per-lock tuning.
    #[serde(flatten)]
    pub options: BlobLeaseOptions,
}

impl BlobLeaseConfig {
    /// Create a configuration for a container.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            prefix: String::new(),
            options: BlobLeaseOptions::default(),
        }
    }

    /// Set the blob name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the lease duration; `None` for infinite.
    pub fn with_lease_duration(mut self, duration: Option<Duration>) -> Self {
        self.options.lease_duration = duration;
        self
    }

    /// Set the renewal cadence.
    pub fn with_renewal_cadence(mut self, cadence: Duration) -> Self {
        self.options.renewal_cadence = Some(cadence);
        self
    }

    /// Turn automatic renewal on or off.
    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.options.auto_renew = auto_renew;
        self
    }

    /// Set the busy-wait sleep bounds.
    pub fn with_busy_wait(mut self, busy_wait: BusyWaitConfig) -> Self {
        self.options.busy_wait = busy_wait;
        self
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
        let container = lookup(ENV_CONTAINER)
            .ok_or_else(|| LockError::Config(format!("{} is not set", ENV_CONTAINER)))?;
        let options = BlobLeaseOptions::default().from_lookup(&lookup)?;
        let config = Self {
            container,
            prefix: String::new(),
            options,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    pub fn validate(&self) -> LockResult<()> {
        if self.container.is_empty() {
            return Err(LockError::Config("container must not be empty".into()));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_cadence_is_a_third() {
        let options = BlobLeaseOptions::default();
        assert_eq!(options.effective_cadence(), Duration::from_secs(10));
        assert!(options.renews());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_lease_duration_bounds() {
        let too_short = BlobLeaseOptions {
            lease_duration: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert!(too_short.validate().is_err());

        let too_long = BlobLeaseOptions {
            lease_duration: Some(Duration::from_secs(61)),
            ..Default::default()
        };
        assert!(too_long.validate().is_err());

        let infinite = BlobLeaseOptions {
            lease_duration: None,
            ..Default::default()
        };
        assert!(infinite.validate().is_ok());
        assert!(!infinite.renews());
        assert!(infinite.lease().unwrap().is_infinite());
    }

    #[test]
    fn test_cadence_must_be_shorter_than_lease() {
        let options = BlobLeaseOptions {
            lease_duration: Some(Duration::from_secs(20)),
            renewal_cadence: Some(Duration::from_secs(20)),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_CONTAINER, "locks"),
            (ENV_LEASE_DURATION, "infinite"),
            (ENV_RENEWAL_CADENCE, "5s"),
        ]
        .into_iter()
        .collect();

        let config = BlobLeaseConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.container, "locks");
        assert_eq!(config.options.lease_duration, None);
        assert_eq!(config.options.effective_cadence(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_lookup_disables_renewal() {
        let config = BlobLeaseConfig::from_lookup(|k| match k {
            ENV_CONTAINER => Some("locks".into()),
            ENV_RENEWAL_CADENCE => Some("infinite".into()),
            _ => None,
        })
        .unwrap();
        assert!(!config.options.renews());
    }

    #[test]
    fn test_deserialize() {
        let config: BlobLeaseConfig = serde_json::from_str(
            r#"{"container": "locks", "lease_duration": "45s", "auto_renew": false}"#,
        )
        .unwrap();
        assert_eq!(config.options.lease_duration, Some(Duration::from_secs(45)));
        assert_eq!(config.options.effective_cadence(), Duration::from_secs(15));
        assert!(!config.options.renews());
        assert_eq!(config.prefix, "");
    }
}

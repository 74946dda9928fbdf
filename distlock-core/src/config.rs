//! Shared configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockError, LockResult};

/// Environment variable for the minimum busy-wait sleep.
pub const ENV_BUSY_WAIT_MIN: &str = "DISTLOCK_BUSY_WAIT_MIN";
/// Environment variable for the maximum busy-wait sleep.
pub const ENV_BUSY_WAIT_MAX: &str = "DISTLOCK_BUSY_WAIT_MAX";

/// Sleep bounds for the busy-wait engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyWaitConfig {
    /// Shortest sleep between attempts.
    #[serde(with = "humantime_serde", default = "default_min_sleep")]
    pub min_sleep: Duration,
    /// Longest sleep between attempts.
    #[serde(with = "humantime_serde", default = "default_max_sleep")]
    pub max_sleep: Duration,
}

fn default_min_sleep() -> Duration {
    Duration::from_millis(250)
}

fn default_max_sleep() -> Duration {
    Duration::from_secs(1)
}

impl Default for BusyWaitConfig {
    fn default() -> Self {
        Self {
            min_sleep: default_min_sleep(),
            max_sleep: default_max_sleep(),
        }
    }
}

impl BusyWaitConfig {
    /// Create validated sleep bounds.
    pub fn new(min_sleep: Duration, max_sleep: Duration) -> LockResult<Self> {
        let config = Self {
            min_sleep,
            max_sleep,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check `0 < min_sleep <= max_sleep`.
    pub fn validate(&self) -> LockResult<()> {
        if self.min_sleep.is_zero() {
            return Err(LockError::Config("busy-wait min_sleep must be positive".into()));
        }
        if self.min_sleep > self.max_sleep {
            return Err(LockError::Config(format!(
                "busy-wait min_sleep {:?} exceeds max_sleep {:?}",
                self.min_sleep, self.max_sleep
            )));
        }
        Ok(())
    }

    /// Override bounds from `DISTLOCK_BUSY_WAIT_MIN` / `DISTLOCK_BUSY_WAIT_MAX`.
    pub fn from_lookup<F>(mut self, lookup: F) -> LockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(min) = duration_var(&lookup, ENV_BUSY_WAIT_MIN)? {
            self.min_sleep = min;
        }
        if let Some(max) = duration_var(&lookup, ENV_BUSY_WAIT_MAX)? {
            self.max_sleep = max;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Read a humantime duration (`"250ms"`, `"30s"`) from a lookup function.
pub fn duration_var<F>(lookup: &F, key: &str) -> LockResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            humantime::parse_duration(value.trim())
                .map_err(|e| LockError::Config(format!("{}: {}", key, e)))
        })
        .transpose()
}

/// Read a parsed value from a lookup function.
pub fn parsed_var<F, T>(lookup: &F, key: &str) -> LockResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| LockError::Config(format!("{}: {}", key, e)))
        })
        .transpose()
}

/// Process environment lookup for `from_lookup` style constructors.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusyWaitConfig::default();
        assert_eq!(config.min_sleep, Duration::from_millis(250));
        assert_eq!(config.max_sleep, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        assert!(BusyWaitConfig::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
        assert!(BusyWaitConfig::new(Duration::ZERO, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = BusyWaitConfig::default()
            .from_lookup(lookup(&[(ENV_BUSY_WAIT_MIN, "10ms"), (ENV_BUSY_WAIT_MAX, "2s")]))
            .unwrap();
        assert_eq!(config.min_sleep, Duration::from_millis(10));
        assert_eq!(config.max_sleep, Duration::from_secs(2));

        let err = BusyWaitConfig::default()
            .from_lookup(lookup(&[(ENV_BUSY_WAIT_MIN, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_BUSY_WAIT_MIN));
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: BusyWaitConfig =
            serde_json::from_str(r#"{"min_sleep": "50ms", "max_sleep": "3s"}"#).unwrap();
        assert_eq!(config.min_sleep, Duration::from_millis(50));
        assert_eq!(config.max_sleep, Duration::from_secs(3));

        let config: BusyWaitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BusyWaitConfig::default());
    }
}

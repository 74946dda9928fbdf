//! Ensemble connection and lock configuration.

use distlock_core::config::{duration_var, env_lookup};
use distlock_core::{LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::path::validate_path;

/// Environment variable for the connect string (`host:port,host:port/chroot`).
pub const ENV_CONNECT: &str = "DISTLOCK_ZK_CONNECT";
/// Environment variable for the session timeout.
pub const ENV_SESSION_TIMEOUT: &str = "DISTLOCK_ZK_SESSION_TIMEOUT";
/// Environment variable for the connect timeout.
pub const ENV_CONNECT_TIMEOUT: &str = "DISTLOCK_ZK_CONNECT_TIMEOUT";
/// Environment variable for the pooled session maximum age.
pub const ENV_MAX_SESSION_AGE: &str = "DISTLOCK_ZK_MAX_SESSION_AGE";

const DEFAULT_PORT: u16 = 2181;

/// Credentials added to a session after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Auth scheme, e.g. `digest`.
    pub scheme: String,
    /// Scheme-specific credentials, e.g. `user:password`.
    pub credentials: Vec<u8>,
}

impl AuthInfo {
    /// Create credentials for a scheme.
    pub fn new(scheme: impl Into<String>, credentials: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.into(),
            credentials: credentials.into(),
        }
    }

    /// `digest` credentials for `user:password`.
    pub fn digest(user: &str, password: &str) -> Self {
        Self::new("digest", format!("{}:{}", user, password))
    }
}

/// Node permission bits.
pub mod perms {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 1 << 1;
    pub const CREATE: u32 = 1 << 2;
    pub const DELETE: u32 = 1 << 3;
    pub const ADMIN: u32 = 1 << 4;
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// Access control entry applied to created nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// Permission bits from [`perms`].
    pub perms: u32,
    /// Identity scheme.
    pub scheme: String,
    /// Identity.
    pub id: String,
}

impl Acl {
    /// Everyone may do anything.
    pub fn open_unsafe() -> Self {
        Self {
            perms: perms::ALL,
            scheme: "world".into(),
            id: "anyone".into(),
        }
    }

    /// Only the authenticated creator may do anything.
    pub fn creator_all() -> Self {
        Self {
            perms: perms::ALL,
            scheme: "auth".into(),
            id: String::new(),
        }
    }
}

/// Everything that identifies a pooled session.
///
/// Two locks with equal parameters share one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Comma-separated `host[:port]` list with an optional `/chroot` suffix.
    pub connect_string: String,
    /// Session timeout negotiated with the ensemble.
    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
    /// How long to wait for the initial connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Credentials added after connecting.
    #[serde(default)]
    pub auth: Vec<AuthInfo>,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

impl ConnectionParams {
    /// Create validated parameters for a connect string.
    pub fn new(connect_string: impl Into<String>) -> LockResult<Self> {
        let params = Self {
            connect_string: connect_string.into(),
            session_timeout: default_session_timeout(),
            connect_timeout: default_connect_timeout(),
            auth: Vec::new(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Set the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add credentials.
    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.auth.push(auth);
        self
    }

    /// Parsed `(host, port)` list.
    pub fn hosts(&self) -> LockResult<Vec<(String, u16)>> {
        let (hosts, _) = split_chroot(&self.connect_string);
        hosts
            .split(',')
            .map(|entry| parse_host(entry.trim(), &self.connect_string))
            .collect()
    }

    /// Chroot suffix, if any.
    pub fn chroot(&self) -> Option<&str> {
        split_chroot(&self.connect_string).1
    }

    /// Check the parameters.
    pub fn validate(&self) -> LockResult<()> {
        if self.connect_string.trim().is_empty() {
            return Err(LockError::Config("connect string must not be empty".into()));
        }
        self.hosts()?;
        if let Some(chroot) = self.chroot() {
            validate_path(chroot).map_err(|e| {
                LockError::Config(format!("invalid chroot in connect string: {}", e))
            })?;
        }
        if self.session_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(LockError::Config("ensemble timeouts must be positive".into()));
        }
        for auth in &self.auth {
            if auth.scheme.is_empty() {
                return Err(LockError::Config("auth scheme must not be empty".into()));
            }
        }
        Ok(())
    }
}

fn split_chroot(connect_string: &str) -> (&str, Option<&str>) {
    match connect_string.find('/') {
        Some(index) => (&connect_string[..index], Some(&connect_string[index..])),
        None => (connect_string, None),
    }
}

fn parse_host(entry: &str, connect_string: &str) -> LockResult<(String, u16)> {
    let invalid = || LockError::Config(format!("malformed connect string '{}'", connect_string));

    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (entry, DEFAULT_PORT),
    };
    if host.is_empty() || host.contains(char::is_whitespace) || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Per-lock node options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZooKeeperOptions {
    /// ACL applied to created nodes.
    #[serde(default = "default_acl")]
    pub acl: Vec<Acl>,
    /// Skip creating the lock path; acquisition fails if it is missing.
    #[serde(default)]
    pub assume_path_exists: bool,
}

fn default_acl() -> Vec<Acl> {
    vec![Acl::open_unsafe()]
}

impl Default for ZooKeeperOptions {
    fn default() -> Self {
        Self {
            acl: default_acl(),
            assume_path_exists: false,
        }
    }
}

/// Ensemble provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZooKeeperConfig {
    /// Session parameters.
    pub connection: ConnectionParams,
    /// Parent node under which lock paths are created.
    #[serde(default = "default_root")]
    pub root: String,
    /// Pooled sessions are retired this long after they were created.
    #[serde(with = "humantime_serde", default = "default_max_session_age")]
    pub max_session_age: Duration,
    /// Per-lock node options.
    #[serde(default)]
    pub options: ZooKeeperOptions,
}

fn default_root() -> String {
    "/distlock".to_string()
}

fn default_max_session_age() -> Duration {
    Duration::from_secs(600)
}

impl ZooKeeperConfig {
    /// Create a configuration for a connect string.
    pub fn new(connect_string: impl Into<String>) -> LockResult<Self> {
        Ok(Self {
            connection: ConnectionParams::new(connect_string)?,
            root: default_root(),
            max_session_age: default_max_session_age(),
            options: ZooKeeperOptions::default(),
        })
    }

    /// Create a builder.
    pub fn builder(connect_string: impl Into<String>) -> ZooKeeperConfigBuilder {
        ZooKeeperConfigBuilder::new(connect_string)
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
        let connect = lookup(ENV_CONNECT)
            .ok_or_else(|| LockError::Config(format!("{} is not set", ENV_CONNECT)))?;

        let mut builder = Self::builder(connect);
        if let Some(timeout) = duration_var(&lookup, ENV_SESSION_TIMEOUT)? {
            builder = builder.session_timeout(timeout);
        }
        if let Some(timeout) = duration_var(&lookup, ENV_CONNECT_TIMEOUT)? {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(age) = duration_var(&lookup, ENV_MAX_SESSION_AGE)? {
            builder = builder.max_session_age(age);
        }
        builder.build()
    }

    /// Check the configuration.
    pub fn validate(&self) -> LockResult<()> {
        self.connection.validate()?;
        validate_path(&self.root).map_err(|e| LockError::Config(format!("invalid root: {}", e)))?;
        if self.max_session_age.is_zero() {
            return Err(LockError::Config("max session age must be positive".into()));
        }
        if self.options.acl.is_empty() {
            return Err(LockError::Config("ACL list must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for [`ZooKeeperConfig`].
pub struct ZooKeeperConfigBuilder {
    connect_string: String,
    session_timeout: Duration,
    connect_timeout: Duration,
    auth: Vec<AuthInfo>,
    root: String,
    max_session_age: Duration,
    options: ZooKeeperOptions,
}

impl ZooKeeperConfigBuilder {
    /// Create a new builder.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            session_timeout: default_session_timeout(),
            connect_timeout: default_connect_timeout(),
            auth: Vec::new(),
            root: default_root(),
            max_session_age: default_max_session_age(),
            options: ZooKeeperOptions::default(),
        }
    }

    /// Set the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add credentials.
    pub fn auth(mut self, auth: AuthInfo) -> Self {
        self.auth.push(auth);
        self
    }

    /// Set the root path.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the pooled session maximum age.
    pub fn max_session_age(mut self, age: Duration) -> Self {
        self.max_session_age = age;
        self
    }

    /// Set the ACL applied to created nodes.
    pub fn acl(mut self, acl: Vec<Acl>) -> Self {
        self.options.acl = acl;
        self
    }

    /// Skip creating lock paths.
    pub fn assume_path_exists(mut self, assume: bool) -> Self {
        self.options.assume_path_exists = assume;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> LockResult<ZooKeeperConfig> {
        let config = ZooKeeperConfig {
            connection: ConnectionParams {
                connect_string: self.connect_string,
                session_timeout: self.session_timeout,
                connect_timeout: self.connect_timeout,
                auth: self.auth,
            },
            root: self.root,
            max_session_age: self.max_session_age,
            options: self.options,
        };
        config.validate()?;
        Ok(config)
    }
}

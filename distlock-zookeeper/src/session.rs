//! Ensemble session boundary.
//!
//! The lock recipes only use a small slice of the ensemble API: node
//! creation, child listing, data, existence watches and session liveness.
//! [`EnsembleConnector`] opens sessions; [`EnsembleSession`] is one live
//! session.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{Acl, ConnectionParams};
use crate::error::EnsembleResult;

/// Node lifetime and naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Lives until deleted.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the node dies with its session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the ensemble appends a sequence suffix.
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Creation time in epoch milliseconds.
    pub ctime: i64,
    /// Data version.
    pub version: i32,
    /// Owning session for ephemeral nodes, `0` otherwise.
    pub ephemeral_owner: u64,
    /// Number of children.
    pub num_children: u32,
}

/// What a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The node was deleted.
    NodeDeleted,
    /// The node's data changed.
    NodeDataChanged,
    /// The session that set the watch ended.
    SessionExpired,
}

/// One-shot watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// Watched path.
    pub path: String,
    /// What happened.
    pub kind: WatchEventKind,
}

/// One live ensemble session.
#[async_trait]
pub trait EnsembleSession: Send + Sync + 'static {
    /// Session id assigned by the ensemble.
    fn session_id(&self) -> u64;

    /// Create a node; returns the actual path (with sequence suffix, if any).
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        acl: &[Acl],
    ) -> EnsembleResult<String>;

    /// Names of the node's children.
    async fn get_children(&self, path: &str) -> EnsembleResult<Vec<String>>;

    /// Node data and metadata.
    async fn get_data(&self, path: &str) -> EnsembleResult<(Vec<u8>, Stat)>;

    /// Replace node data, optionally conditioned on `version`.
    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>)
    -> EnsembleResult<Stat>;

    /// Node metadata, or `None` when absent.
    async fn exists(&self, path: &str) -> EnsembleResult<Option<Stat>>;

    /// Delete a childless node, optionally conditioned on `version`.
    async fn delete(&self, path: &str, version: Option<i32>) -> EnsembleResult<()>;

    /// Set a one-shot watch on an existing node.
    ///
    /// Returns `None` when the node does not exist. The receiver fires once
    /// on deletion, a data change, or the end of the session.
    async fn watch(
        &self,
        path: &str,
    ) -> EnsembleResult<Option<(Stat, oneshot::Receiver<WatchedEvent>)>>;

    /// Token fired once the session is lost or closed.
    fn connection_lost(&self) -> CancellationToken;

    /// End the session, deleting its ephemeral nodes.
    async fn close(&self);
}

/// Opens ensemble sessions.
#[async_trait]
pub trait EnsembleConnector: Send + Sync + 'static {
    /// Connect and authenticate with `params`.
    async fn connect(&self, params: &ConnectionParams) -> EnsembleResult<Arc<dyn EnsembleSession>>;
}

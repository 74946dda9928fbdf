//! ZooKeeper ensemble backend.
//!
//! [`ZooKeeperConnector`] opens sessions with the `zookeeper-client` crate.
//! Session state changes are watched in the background so a session that
//! expires, closes or fails authentication fires its connection-lost token.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::config::{Acl, ConnectionParams};
use crate::error::{EnsembleError, EnsembleResult};
use crate::path::SEQUENCE_WIDTH;
use crate::session::{
    CreateMode, EnsembleConnector, EnsembleSession, Stat, WatchEventKind, WatchedEvent,
};

/// Opens sessions against a real ensemble.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperConnector;

impl ZooKeeperConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EnsembleConnector for ZooKeeperConnector {
    async fn connect(&self, params: &ConnectionParams) -> EnsembleResult<Arc<dyn EnsembleSession>> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(params.session_timeout);
        connector.connection_timeout(params.connect_timeout);
        for auth in &params.auth {
            connector.auth(auth.scheme.clone(), auth.credentials.clone());
        }
        let client = connector
            .connect(&params.connect_string)
            .await
            .map_err(|e| map_error(&params.connect_string, e))?;

        let id = client.session_id().0 as u64;
        let lost = CancellationToken::new();
        tokio::spawn(watch_state(client.state_watcher(), id, lost.clone()));
        info!(session = id, connect = %params.connect_string, "Opened ZooKeeper session");

        Ok(Arc::new(ClientSession {
            id,
            client: Mutex::new(Some(client)),
            lost,
        }))
    }
}

async fn watch_state(mut states: zk::StateWatcher, id: u64, lost: CancellationToken) {
    loop {
        let state = tokio::select! {
            _ = lost.cancelled() => return,
            state = states.changed() => state,
        };
        match state {
            zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed => {
                warn!(session = id, state = ?state, "ZooKeeper session ended");
                lost.cancel();
                return;
            }
            other => debug!(session = id, state = ?other, "ZooKeeper session state changed"),
        }
    }
}

struct ClientSession {
    id: u64,
    client: Mutex<Option<zk::Client>>,
    lost: CancellationToken,
}

impl ClientSession {
    fn client(&self) -> EnsembleResult<zk::Client> {
        self.client.lock().clone().ok_or(EnsembleError::SessionExpired)
    }
}

/// Translate a client error into the ensemble error vocabulary.
fn map_error(path: &str, err: zk::Error) -> EnsembleError {
    match err {
        zk::Error::NoNode => EnsembleError::NoNode(path.to_string()),
        zk::Error::NodeExists => EnsembleError::NodeExists(path.to_string()),
        zk::Error::NotEmpty => EnsembleError::NotEmpty(path.to_string()),
        zk::Error::NoChildrenForEphemerals => {
            EnsembleError::NoChildrenForEphemerals(path.to_string())
        }
        zk::Error::BadVersion => EnsembleError::BadVersion(path.to_string()),
        zk::Error::BadArguments(reason) => {
            EnsembleError::InvalidPath(format!("{}: {}", path, reason))
        }
        zk::Error::ConnectionLoss | zk::Error::Timeout => EnsembleError::ConnectionLoss,
        zk::Error::SessionExpired | zk::Error::ClientClosed => EnsembleError::SessionExpired,
        zk::Error::AuthFailed => EnsembleError::AuthFailed("rejected by the ensemble".into()),
        zk::Error::NoAuth => EnsembleError::AuthFailed(format!("not authorized for {}", path)),
        other => EnsembleError::Other(other.to_string()),
    }
}

fn map_stat(stat: &zk::Stat) -> Stat {
    Stat {
        czxid: stat.czxid,
        ctime: stat.ctime,
        version: stat.version,
        ephemeral_owner: stat.ephemeral_owner as u64,
        num_children: stat.num_children as u32,
    }
}

fn map_event(event: &zk::WatchedEvent) -> WatchEventKind {
    match event.event_type {
        zk::EventType::NodeDeleted => WatchEventKind::NodeDeleted,
        zk::EventType::Session => WatchEventKind::SessionExpired,
        _ => WatchEventKind::NodeDataChanged,
    }
}

fn map_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

/// Whether `acl` asks for creator-only access.
///
/// The client only exposes its built-in ACL sets.
fn creator_only(acl: &[Acl]) -> EnsembleResult<bool> {
    if acl.is_empty() || acl == [Acl::open_unsafe()] {
        Ok(false)
    } else if acl == [Acl::creator_all()] {
        Ok(true)
    } else {
        Err(EnsembleError::Other(
            "only the open and creator-only ACLs are supported".into(),
        ))
    }
}

#[async_trait]
impl EnsembleSession for ClientSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        acl: &[Acl],
    ) -> EnsembleResult<String> {
        let acls = if creator_only(acl)? {
            zk::Acls::creator_all()
        } else {
            zk::Acls::anyone_all()
        };
        let options = map_mode(mode).with_acls(acls);
        let (_, sequence) = self
            .client()?
            .create(path, &data, &options)
            .await
            .map_err(|e| map_error(path, e))?;
        if mode.is_sequential() {
            Ok(format!("{}{:0width$}", path, sequence.0, width = SEQUENCE_WIDTH))
        } else {
            Ok(path.to_string())
        }
    }

    async fn get_children(&self, path: &str) -> EnsembleResult<Vec<String>> {
        self.client()?
            .list_children(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn get_data(&self, path: &str) -> EnsembleResult<(Vec<u8>, Stat)> {
        let (data, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((data, map_stat(&stat)))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> EnsembleResult<Stat> {
        let stat = self
            .client()?
            .set_data(path, &data, version)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(map_stat(&stat))
    }

    async fn exists(&self, path: &str) -> EnsembleResult<Option<Stat>> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(stat.as_ref().map(map_stat))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> EnsembleResult<()> {
        self.client()?
            .delete(path, version)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn watch(
        &self,
        path: &str,
    ) -> EnsembleResult<Option<(Stat, oneshot::Receiver<WatchedEvent>)>> {
        let (stat, watcher) = self
            .client()?
            .check_and_watch_stat(path)
            .await
            .map_err(|e| map_error(path, e))?;
        let Some(stat) = stat else {
            return Ok(None);
        };

        let (mut sender, receiver) = oneshot::channel();
        let watched = path.to_string();
        tokio::spawn(async move {
            let event = tokio::select! {
                _ = sender.closed() => return,
                event = watcher.changed() => event,
            };
            let kind = map_event(&event);
            let _ = sender.send(WatchedEvent { path: watched, kind });
        });
        Ok(Some((map_stat(&stat), receiver)))
    }

    fn connection_lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        // Dropping the last client handle closes the session.
        if self.client.lock().take().is_some() {
            debug!(session = self.id, "Closed ZooKeeper session");
        }
        self.lost.cancel();
    }
}

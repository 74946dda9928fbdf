//! In-memory ensemble.
//!
//! Implements [`EnsembleConnector`] and [`EnsembleSession`] over a shared
//! node tree. Sessions, ephemeral nodes, sequence counters and one-shot
//! watches behave like a single-server ensemble, which makes it a faithful
//! test double for the lock recipes. ACLs are accepted but not enforced and
//! chroot suffixes are ignored.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Acl, AuthInfo, ConnectionParams};
use crate::error::{EnsembleError, EnsembleResult};
use crate::path::{self, SEQUENCE_WIDTH, validate_path};
use crate::session::{
    CreateMode, EnsembleConnector, EnsembleSession, Stat, WatchEventKind, WatchedEvent,
};

struct Node {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
    next_sequence: i32,
}

impl Node {
    fn new(data: Vec<u8>, stat: Stat) -> Self {
        Self {
            data,
            stat,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

struct Watch {
    session: u64,
    sender: oneshot::Sender<WatchedEvent>,
}

struct EnsembleState {
    nodes: HashMap<String, Node>,
    sessions: HashMap<u64, CancellationToken>,
    watches: HashMap<String, Vec<Watch>>,
    next_session_id: u64,
    zxid: i64,
    connects: usize,
    required_auth: Option<AuthInfo>,
    available: bool,
}

impl EnsembleState {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), Stat::default()));
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
            next_session_id: 1,
            zxid: 0,
            connects: 0,
            required_auth: None,
            available: true,
        }
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        for watch in self.watches.remove(path).unwrap_or_default() {
            let _ = watch.sender.send(WatchedEvent {
                path: path.to_string(),
                kind,
            });
        }
    }

    fn create(
        &mut self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> EnsembleResult<String> {
        validate_path(path)?;
        let parent_path = path::parent(path)
            .ok_or_else(|| EnsembleError::NodeExists(path.to_string()))?
            .to_string();

        let actual = {
            let parent = self
                .nodes
                .get_mut(&parent_path)
                .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
            if parent.stat.ephemeral_owner != 0 {
                return Err(EnsembleError::NoChildrenForEphemerals(parent_path));
            }
            let sequence = parent.next_sequence;
            parent.next_sequence = sequence.wrapping_add(1);
            if mode.is_sequential() {
                format!("{}{:0width$}", path, sequence, width = SEQUENCE_WIDTH)
            } else {
                path.to_string()
            }
        };
        if self.nodes.contains_key(&actual) {
            return Err(EnsembleError::NodeExists(actual));
        }

        self.zxid += 1;
        let stat = Stat {
            czxid: self.zxid,
            ctime: chrono::Utc::now().timestamp_millis(),
            version: 0,
            ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
            num_children: 0,
        };
        self.nodes.insert(actual.clone(), Node::new(data, stat));
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(path::node_name(&actual).to_string());
            parent.stat.num_children += 1;
        }
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> EnsembleResult<()> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
        if path == "/" {
            return Err(EnsembleError::InvalidPath("cannot delete the root".into()));
        }
        if version.is_some_and(|v| v != node.stat.version) {
            return Err(EnsembleError::BadVersion(path.to_string()));
        }
        if !node.children.is_empty() {
            return Err(EnsembleError::NotEmpty(path.to_string()));
        }
        self.remove_node(path);
        Ok(())
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.children.remove(path::node_name(path));
            parent.stat.num_children = parent.stat.num_children.saturating_sub(1);
        }
        self.fire(path, WatchEventKind::NodeDeleted);
    }

    fn set_data(&mut self, path: &str, data: Vec<u8>, version: Option<i32>) -> EnsembleResult<Stat> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
        if version.is_some_and(|v| v != node.stat.version) {
            return Err(EnsembleError::BadVersion(path.to_string()));
        }
        node.data = data;
        node.stat.version += 1;
        let stat = node.stat;
        self.fire(path, WatchEventKind::NodeDataChanged);
        Ok(stat)
    }

    /// End a session; returns its loss token for the caller to fire.
    fn expire(&mut self, session: u64) -> Option<CancellationToken> {
        let token = self.sessions.remove(&session)?;

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            self.remove_node(&path);
        }

        for (path, watches) in self.watches.iter_mut() {
            let (mine, others): (Vec<Watch>, Vec<Watch>) =
                watches.drain(..).partition(|w| w.session == session);
            *watches = others;
            for watch in mine {
                let _ = watch.sender.send(WatchedEvent {
                    path: path.clone(),
                    kind: WatchEventKind::SessionExpired,
                });
            }
        }
        self.watches.retain(|_, watches| !watches.is_empty());

        Some(token)
    }
}

/// Shared in-memory ensemble.
///
/// Clones share the same tree, so a test can hold one clone to inspect or
/// expire sessions while a provider connects through another.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl InMemoryEnsemble {
    /// Create an empty ensemble containing only the root node.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::new())),
        }
    }

    /// Reject sessions that do not carry `auth`.
    pub fn require_auth(&self, auth: AuthInfo) {
        self.state.lock().required_auth = Some(auth);
    }

    /// Make new connection attempts time out (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Expire a session as if its heartbeats stopped.
    ///
    /// Deletes the session's ephemeral nodes, fires watches, and fires the
    /// session's connection-lost token. Returns `false` for unknown sessions.
    pub fn expire_session(&self, session_id: u64) -> bool {
        let token = self.state.lock().expire(session_id);
        match token {
            Some(token) => {
                debug!(session = session_id, "Session expired");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Ids of sessions that are still live.
    pub fn live_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Child names of `path`, empty when the node is missing.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `path` exists.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Data stored at `path`.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Set the next sequence number handed out under `path`.
    ///
    /// Returns `false` when `path` does not exist.
    pub fn set_next_sequence(&self, path: &str, next: i32) -> bool {
        match self.state.lock().nodes.get_mut(path) {
            Some(node) => {
                node.next_sequence = next;
                true
            }
            None => false,
        }
    }

    /// Delete a node regardless of owner, firing its watches.
    pub fn remove(&self, path: &str) -> EnsembleResult<()> {
        self.state.lock().delete(path, None)
    }
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnsembleConnector for InMemoryEnsemble {
    async fn connect(&self, params: &ConnectionParams) -> EnsembleResult<Arc<dyn EnsembleSession>> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(EnsembleError::ConnectTimeout(params.connect_string.clone()));
        }
        if let Some(required) = &state.required_auth {
            if !params.auth.contains(required) {
                return Err(EnsembleError::AuthFailed(format!(
                    "scheme '{}' rejected",
                    required.scheme
                )));
            }
        }

        let id = state.next_session_id;
        state.next_session_id += 1;
        state.connects += 1;
        let lost = CancellationToken::new();
        state.sessions.insert(id, lost.clone());
        debug!(session = id, connect = %params.connect_string, "Session opened");

        Ok(Arc::new(MemorySession {
            id,
            state: self.state.clone(),
            lost,
        }))
    }
}

struct MemorySession {
    id: u64,
    state: Arc<Mutex<EnsembleState>>,
    lost: CancellationToken,
}

impl MemorySession {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut EnsembleState) -> EnsembleResult<T>,
    ) -> EnsembleResult<T> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(EnsembleError::SessionExpired);
        }
        f(&mut state)
    }
}

#[async_trait]
impl EnsembleSession for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        _acl: &[Acl],
    ) -> EnsembleResult<String> {
        self.with_state(|state| state.create(self.id, path, data, mode))
    }

    async fn get_children(&self, path: &str) -> EnsembleResult<Vec<String>> {
        self.with_state(|state| {
            state
                .nodes
                .get(path)
                .map(|node| node.children.iter().cloned().collect())
                .ok_or_else(|| EnsembleError::NoNode(path.to_string()))
        })
    }

    async fn get_data(&self, path: &str) -> EnsembleResult<(Vec<u8>, Stat)> {
        self.with_state(|state| {
            state
                .nodes
                .get(path)
                .map(|node| (node.data.clone(), node.stat))
                .ok_or_else(|| EnsembleError::NoNode(path.to_string()))
        })
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> EnsembleResult<Stat> {
        self.with_state(|state| state.set_data(path, data, version))
    }

    async fn exists(&self, path: &str) -> EnsembleResult<Option<Stat>> {
        self.with_state(|state| Ok(state.nodes.get(path).map(|node| node.stat)))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> EnsembleResult<()> {
        self.with_state(|state| state.delete(path, version))
    }

    async fn watch(
        &self,
        path: &str,
    ) -> EnsembleResult<Option<(Stat, oneshot::Receiver<WatchedEvent>)>> {
        self.with_state(|state| {
            let Some(stat) = state.nodes.get(path).map(|node| node.stat) else {
                return Ok(None);
            };
            let (sender, receiver) = oneshot::channel();
            state.watches.entry(path.to_string()).or_default().push(Watch {
                session: self.id,
                sender,
            });
            Ok(Some((stat, receiver)))
        })
    }

    fn connection_lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        let token = self.state.lock().expire(self.id);
        if let Some(token) = token {
            debug!(session = self.id, "Session closed");
            token.cancel();
        }
    }
}

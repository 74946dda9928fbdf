//! Shared session pool.
//!
//! Locks with equal [`ConnectionParams`] share one ensemble session. Each
//! session is reference counted by the [`PooledSession`] guards handed out,
//! reused until `max_session_age` after it was created, and retired
//! immediately when its connection is lost. A retired session is closed as
//! soon as its last user lets go; an aged-out idle session is closed by a
//! timer task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use distlock_core::LockResult;

use crate::config::ConnectionParams;
use crate::error::EnsembleError;
use crate::session::{EnsembleConnector, EnsembleSession};

type SessionCell = Arc<OnceCell<Arc<dyn EnsembleSession>>>;

struct Entry {
    params: ConnectionParams,
    created_at: Instant,
    refs: usize,
    retired: bool,
    idle_timer: bool,
    cell: SessionCell,
}

impl Entry {
    fn is_lost(&self) -> bool {
        self.cell
            .get()
            .is_some_and(|session| session.connection_lost().is_cancelled())
    }
}

#[derive(Default)]
struct PoolState {
    current: HashMap<ConnectionParams, u64>,
    entries: HashMap<u64, Entry>,
    next_generation: u64,
}

impl PoolState {
    /// Forget an entry, returning its session if one was connected.
    fn remove(&mut self, generation: u64) -> Option<Arc<dyn EnsembleSession>> {
        let entry = self.entries.remove(&generation)?;
        if self.current.get(&entry.params) == Some(&generation) {
            self.current.remove(&entry.params);
        }
        entry.cell.get().cloned()
    }
}

struct PoolInner {
    connector: Arc<dyn EnsembleConnector>,
    max_session_age: Duration,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn release_ref(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&generation) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }

        let deadline = entry.created_at + self.max_session_age;
        let connected = entry.cell.initialized();
        if entry.retired || !connected || Instant::now() >= deadline {
            if let Some(session) = state.remove(generation) {
                close_detached(session);
            }
            return;
        }
        // The deadline is fixed per generation, so one timer covers every idle spell.
        if entry.idle_timer {
            return;
        }
        entry.idle_timer = true;
        drop(state);

        // Idle: close once the session ages out unless someone picks it up.
        let weak = Arc::downgrade(self);
        spawn_detached(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_idle(generation);
            }
        });
    }

    fn expire_idle(&self, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&generation) else {
            return;
        };
        entry.retired = true;
        if entry.refs == 0 {
            if let Some(session) = state.remove(generation) {
                debug!(session = session.session_id(), "Closing aged-out idle session");
                close_detached(session);
            }
        }
    }

    fn on_connection_lost(&self, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&generation) else {
            return;
        };
        entry.retired = true;
        warn!(
            connect = %entry.params.connect_string,
            "Ensemble session lost; retiring pooled session"
        );
        let params = entry.params.clone();
        if entry.refs == 0 {
            state.remove(generation);
        } else if state.current.get(&params) == Some(&generation) {
            state.current.remove(&params);
        }
    }
}

fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
        }
        Err(_) => warn!("Session pool used outside a tokio runtime; cleanup skipped"),
    }
}

fn close_detached(session: Arc<dyn EnsembleSession>) {
    spawn_detached(async move {
        debug!(session = session.session_id(), "Closing pooled session");
        session.close().await;
    });
}

/// Reference-counted ensemble session pool.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool opening sessions through `connector`.
    pub fn new(connector: Arc<dyn EnsembleConnector>, max_session_age: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                max_session_age,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Maximum age of a pooled session, measured from creation.
    pub fn max_session_age(&self) -> Duration {
        self.inner.max_session_age
    }

    /// Get a session for `params`, connecting if no usable one is pooled.
    pub async fn acquire(&self, params: &ConnectionParams) -> LockResult<PooledSession> {
        let (reference, cell) = self.checkout(params);

        let connector = self.inner.connector.clone();
        let weak = Arc::downgrade(&self.inner);
        let generation = reference.generation;
        let session = cell
            .get_or_try_init(|| connect(connector, params.clone(), weak, generation))
            .await?
            .clone();

        Ok(PooledSession { session, reference })
    }

    /// Number of connected sessions currently pooled.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.cell.initialized())
            .count()
    }

    fn checkout(&self, params: &ConnectionParams) -> (PoolRef, SessionCell) {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        let max_age = self.inner.max_session_age;

        let reusable = state.current.get(params).copied().filter(|generation| {
            state.entries.get(generation).is_some_and(|entry| {
                !entry.retired && now < entry.created_at + max_age && !entry.is_lost()
            })
        });

        let generation = match reusable {
            Some(generation) => generation,
            None => {
                if let Some(old) = state.current.remove(params) {
                    if let Some(entry) = state.entries.get_mut(&old) {
                        entry.retired = true;
                    }
                }
                let generation = state.next_generation;
                state.next_generation += 1;
                state.entries.insert(
                    generation,
                    Entry {
                        params: params.clone(),
                        created_at: now,
                        refs: 0,
                        retired: false,
                        idle_timer: false,
                        cell: Arc::new(OnceCell::new()),
                    },
                );
                state.current.insert(params.clone(), generation);
                generation
            }
        };

        let mut cell = None;
        if let Some(entry) = state.entries.get_mut(&generation) {
            entry.refs += 1;
            cell = Some(entry.cell.clone());
        }
        let reference = PoolRef {
            pool: self.inner.clone(),
            generation,
        };
        (reference, cell.unwrap_or_default())
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("max_session_age", &self.inner.max_session_age)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

async fn connect(
    connector: Arc<dyn EnsembleConnector>,
    params: ConnectionParams,
    pool: Weak<PoolInner>,
    generation: u64,
) -> LockResult<Arc<dyn EnsembleSession>> {
    let session = tokio::time::timeout(params.connect_timeout, connector.connect(&params))
        .await
        .map_err(|_| EnsembleError::ConnectTimeout(params.connect_string.clone()))??;
    info!(
        session = session.session_id(),
        connect = %params.connect_string,
        "Connected to ensemble"
    );

    let lost = session.connection_lost();
    spawn_detached(async move {
        lost.cancelled().await;
        if let Some(inner) = pool.upgrade() {
            inner.on_connection_lost(generation);
        }
    });
    Ok(session)
}

struct PoolRef {
    pool: Arc<PoolInner>,
    generation: u64,
}

impl Clone for PoolRef {
    fn clone(&self) -> Self {
        if let Some(entry) = self.pool.state.lock().entries.get_mut(&self.generation) {
            entry.refs += 1;
        }
        Self {
            pool: self.pool.clone(),
            generation: self.generation,
        }
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        self.pool.release_ref(self.generation);
    }
}

/// A checked-out pooled session.
///
/// Dereferences to the session. Dropping the last guard for a retired
/// session closes it.
#[derive(Clone)]
pub struct PooledSession {
    session: Arc<dyn EnsembleSession>,
    reference: PoolRef,
}

impl PooledSession {
    /// The underlying session.
    pub fn session(&self) -> &Arc<dyn EnsembleSession> {
        &self.session
    }
}

impl Deref for PooledSession {
    type Target = dyn EnsembleSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session_id", &self.session.session_id())
            .field("generation", &self.reference.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEnsemble;
    use distlock_core::LockError;

    const MAX_AGE: Duration = Duration::from_secs(60);

    fn pool(ensemble: &InMemoryEnsemble) -> SessionPool {
        SessionPool::new(Arc::new(ensemble.clone()), MAX_AGE)
    }

    fn params(connect: &str) -> ConnectionParams {
        ConnectionParams::new(connect).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_params_share_a_session() {
        let ensemble = InMemoryEnsemble::new();
        let pool = pool(&ensemble);

        let a = pool.acquire(&params("zk1:2181")).await.unwrap();
        let b = pool.acquire(&params("zk1:2181")).await.unwrap();
        let c = pool.acquire(&params("zk2:2181")).await.unwrap();

        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.session_id(), c.session_id());
        assert_eq!(ensemble.connect_count(), 2);
        assert_eq!(pool.active_sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_closed_after_max_age() {
        let ensemble = InMemoryEnsemble::new();
        let pool = pool(&ensemble);

        let session = pool.acquire(&params("zk1")).await.unwrap();
        let id = session.session_id();
        drop(session);

        // Reused while young.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let again = pool.acquire(&params("zk1")).await.unwrap();
        assert_eq!(again.session_id(), id);
        drop(again);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(ensemble.live_sessions().is_empty());
        assert_eq!(pool.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_churn_arms_one_idle_timer() {
        let ensemble = InMemoryEnsemble::new();
        let pool = pool(&ensemble);
        let metrics = tokio::runtime::Handle::current().metrics();

        let session = pool.acquire(&params("zk1")).await.unwrap();
        drop(session);
        let baseline = metrics.num_alive_tasks();

        for _ in 0..200 {
            let session = pool.acquire(&params("zk1")).await.unwrap();
            drop(session);
        }
        assert_eq!(metrics.num_alive_tasks(), baseline);
        assert_eq!(ensemble.connect_count(), 1);

        // The single timer still closes the session once it ages out.
        tokio::time::sleep(MAX_AGE + Duration::from_secs(1)).await;
        assert!(ensemble.live_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_session_retired_while_in_use() {
        let ensemble = InMemoryEnsemble::new();
        let pool = pool(&ensemble);

        let old = pool.acquire(&params("zk1")).await.unwrap();
        tokio::time::sleep(MAX_AGE + Duration::from_secs(1)).await;

        let new = pool.acquire(&params("zk1")).await.unwrap();
        assert_ne!(old.session_id(), new.session_id());
        assert_eq!(ensemble.live_sessions().len(), 2);

        let old_id = old.session_id();
        drop(old);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!ensemble.live_sessions().contains(&old_id));
        assert_eq!(ensemble.live_sessions(), vec![new.session_id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_replaced() {
        let ensemble = InMemoryEnsemble::new();
        let pool = pool(&ensemble);

        let first = pool.acquire(&params("zk1")).await.unwrap();
        ensemble.expire_session(first.session_id());

        let second = pool.acquire(&params("zk1")).await.unwrap();
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(ensemble.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_reported() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.set_available(false);
        let pool = pool(&ensemble);

        let result = pool.acquire(&params("zk1")).await;
        assert!(matches!(result, Err(LockError::ConnectionLost(_))));
        assert_eq!(pool.active_sessions(), 0);

        ensemble.set_available(true);
        assert!(pool.acquire(&params("zk1")).await.is_ok());
    }
}

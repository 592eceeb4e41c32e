//! Sessions: one thread of control with its transactional state.

use crate::locks::SessionControl;
use kestrel_common::{KestrelError, Result, RowAction, Scn, SessionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Marker taken at `savepoint`: the length of the action list and the SCN
/// at that moment.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    pub actions_len: usize,
    pub scn: Scn,
}

#[derive(Default)]
struct SessionState {
    in_transaction: bool,
    abort_transaction: bool,
    transaction_scn: Scn,
    action_scn: Scn,
    transaction_end_scn: Scn,
    actions: Vec<Arc<RowAction>>,
    savepoints: Vec<Savepoint>,
}

/// A session's transactional state. All mutation goes through the
/// transaction manager; the session itself is bookkeeping.
pub struct Session {
    id: SessionId,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    /// Set when this session was chosen as a deadlock victim; every
    /// operation except rollback is rejected until the rollback happens.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().abort_transaction
    }

    pub fn flag_abort(&self) {
        self.state.lock().abort_transaction = true;
    }

    pub fn transaction_scn(&self) -> Scn {
        self.state.lock().transaction_scn
    }

    pub fn action_scn(&self) -> Scn {
        self.state.lock().action_scn
    }

    /// SCN stamped at the last commit or rollback.
    pub fn transaction_end_scn(&self) -> Scn {
        self.state.lock().transaction_end_scn
    }

    /// Enters a transaction. Returns false when one is already active
    /// (idempotent begin).
    pub(crate) fn begin(&self, scn: Scn) -> bool {
        let mut state = self.state.lock();
        if state.in_transaction {
            return false;
        }
        state.in_transaction = true;
        state.transaction_scn = scn;
        state.action_scn = scn;
        true
    }

    pub(crate) fn set_action_scn(&self, scn: Scn) {
        self.state.lock().action_scn = scn;
    }

    pub(crate) fn push_action(&self, action: Arc<RowAction>) {
        self.state.lock().actions.push(action);
    }

    pub(crate) fn actions_len(&self) -> usize {
        self.state.lock().actions.len()
    }

    /// Snapshot of the action list suffix starting at `from`.
    pub(crate) fn actions_from(&self, from: usize) -> Vec<Arc<RowAction>> {
        let state = self.state.lock();
        state.actions.get(from..).unwrap_or(&[]).to_vec()
    }

    pub(crate) fn truncate_actions(&self, len: usize) {
        let mut state = self.state.lock();
        state.actions.truncate(len);
        state.savepoints.retain(|sp| sp.actions_len <= len);
    }

    /// Records a savepoint and returns its index.
    pub(crate) fn push_savepoint(&self, scn: Scn) -> usize {
        let mut state = self.state.lock();
        let savepoint = Savepoint {
            actions_len: state.actions.len(),
            scn,
        };
        state.savepoints.push(savepoint);
        state.savepoints.len() - 1
    }

    /// Takes the savepoint at `index`, discarding it and every later one.
    pub(crate) fn take_savepoint(&self, index: usize) -> Result<Savepoint> {
        let mut state = self.state.lock();
        if index >= state.savepoints.len() {
            return Err(KestrelError::InvalidParameter {
                name: "savepoint".to_string(),
                value: index.to_string(),
            });
        }
        let savepoint = state.savepoints[index];
        state.savepoints.truncate(index);
        Ok(savepoint)
    }

    /// Leaves the transaction: stamps the end SCN and clears all
    /// transactional state, including an abort flag.
    pub(crate) fn finish(&self, end_scn: Scn) {
        let mut state = self.state.lock();
        state.in_transaction = false;
        state.abort_transaction = false;
        state.transaction_end_scn = end_scn;
        state.actions.clear();
        state.savepoints.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("in_transaction", &state.in_transaction)
            .field("aborted", &state.abort_transaction)
            .field("actions", &state.actions.len())
            .finish()
    }
}

/// Registry of live sessions; also answers the lock table's questions
/// about them.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create(&self) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id));
        self.sessions.write().insert(id, session.clone());
        session
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KestrelError::InvalidParameter {
                name: "session".to_string(),
                value: id.0.to_string(),
            })
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl for SessionRegistry {
    fn is_aborted(&self, session: SessionId) -> bool {
        self.sessions
            .read()
            .get(&session)
            .map(|s| s.is_aborted())
            .unwrap_or(false)
    }

    fn flag_abort(&self, session: SessionId) {
        if let Some(s) = self.sessions.read().get(&session) {
            s.flag_abort();
        }
    }

    fn txn_scn(&self, session: SessionId) -> Scn {
        self.sessions
            .read()
            .get(&session)
            .map(|s| s.transaction_scn())
            .unwrap_or(Scn(0))
    }
}

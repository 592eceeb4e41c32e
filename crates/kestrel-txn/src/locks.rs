//! Table-level lock table with deadlock detection.
//!
//! Locks are shared (read) or exclusive (write) per table and held until
//! end of transaction. Conflicting requests park on a condvar; while a
//! session waits, its edges in the wait-for graph point at the holders
//! blocking it. A cycle in that graph is a deadlock: the youngest cycle
//! member (highest transaction SCN) is flagged for abort and woken.

use kestrel_common::{KestrelError, Result, Scn, SessionId, TableId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Lock strength on one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// What the lock table needs to know about sessions. Implemented by the
/// session registry; keeps the lock table free of session bookkeeping.
pub trait SessionControl: Send + Sync {
    fn is_aborted(&self, session: SessionId) -> bool;
    fn flag_abort(&self, session: SessionId);
    fn txn_scn(&self, session: SessionId) -> Scn;
}

/// Directed wait-for graph: `waiter -> holders` edges for blocked lock
/// requests. A cycle means deadlock.
#[derive(Default)]
pub struct WaitForGraph {
    edges: HashMap<SessionId, HashSet<SessionId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the waiter's outgoing edges with the current holder set.
    /// An empty set clears the waiter.
    pub fn set_waits(&mut self, waiter: SessionId, holders: &[SessionId]) {
        if holders.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges
                .insert(waiter, holders.iter().copied().collect());
        }
    }

    /// Drops the session from both sides of the graph.
    pub fn remove_session(&mut self, session: SessionId) {
        self.edges.remove(&session);
        for holders in self.edges.values_mut() {
            holders.remove(&session);
        }
    }

    /// Finds one cycle, if any, as the list of sessions on it.
    pub fn find_cycle(&self) -> Option<Vec<SessionId>> {
        let mut visited = HashSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(cycle) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: SessionId,
        visited: &mut HashSet<SessionId>,
        path: &mut Vec<SessionId>,
        on_path: &mut HashSet<SessionId>,
    ) -> Option<Vec<SessionId>> {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        if let Some(holders) = self.edges.get(&node) {
            for &holder in holders {
                if on_path.contains(&holder) {
                    let start = path.iter().position(|&s| s == holder)?;
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(&holder) {
                    if let Some(cycle) = self.dfs(holder, visited, path, on_path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}

#[derive(Default)]
struct TableLock {
    shared: HashSet<SessionId>,
    exclusive: Option<SessionId>,
}

impl TableLock {
    /// Sessions (other than the requester) whose grants conflict with the
    /// requested mode.
    fn conflicts(&self, session: SessionId, mode: LockMode) -> Vec<SessionId> {
        let mut out = Vec::new();
        if let Some(holder) = self.exclusive {
            if holder != session {
                out.push(holder);
            }
        }
        if mode == LockMode::Exclusive {
            out.extend(self.shared.iter().copied().filter(|&s| s != session));
        }
        out
    }

    fn grant(&mut self, session: SessionId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(session);
            }
            LockMode::Exclusive => {
                self.exclusive = Some(session);
            }
        }
    }

    fn is_unlocked(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

struct LockState {
    tables: HashMap<TableId, TableLock>,
    graph: WaitForGraph,
}

/// The lock table: per-table S/X grants, parked waiters, and the
/// wait-for graph.
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Waiters re-check their situation at least this often, so an abort
/// flag set without a matching notification is still observed.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

impl LockTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                tables: HashMap::new(),
                graph: WaitForGraph::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Acquires a table lock for the session, blocking while conflicting
    /// grants exist. Lock upgrades (S held, X requested) take the same
    /// path.
    ///
    /// Errors: `Deadlock` when this request closes a cycle and the session
    /// is chosen victim; `LockWaitAbort` when the session was flagged for
    /// abort while waiting.
    pub fn acquire(
        &self,
        session: SessionId,
        table: TableId,
        mode: LockMode,
        sessions: &dyn SessionControl,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        loop {
            let state = &mut *guard;
            if sessions.is_aborted(session) {
                state.graph.remove_session(session);
                return Err(KestrelError::LockWaitAbort { session: session.0 });
            }

            let entry = state.tables.entry(table).or_default();
            let conflicts = entry.conflicts(session, mode);
            if conflicts.is_empty() {
                entry.grant(session, mode);
                state.graph.set_waits(session, &[]);
                return Ok(());
            }

            state.graph.set_waits(session, &conflicts);
            if let Some(cycle) = state.graph.find_cycle() {
                let victim = Self::pick_victim(&cycle, sessions);
                tracing::warn!(
                    victim = victim.0,
                    cycle = ?cycle.iter().map(|s| s.0).collect::<Vec<_>>(),
                    "deadlock detected"
                );
                sessions.flag_abort(victim);
                state.graph.remove_session(victim);
                if victim == session {
                    return Err(KestrelError::Deadlock { session: session.0 });
                }
                // Wake the victim so it observes its abort flag.
                self.released.notify_all();
            }

            self.released.wait_for(&mut guard, WAIT_RECHECK);
        }
    }

    /// Youngest transaction on the cycle: highest transaction SCN, ties
    /// broken by session id.
    fn pick_victim(cycle: &[SessionId], sessions: &dyn SessionControl) -> SessionId {
        cycle
            .iter()
            .copied()
            .max_by_key(|&s| (sessions.txn_scn(s), s))
            .unwrap_or(cycle[0])
    }

    /// Releases every lock the session holds and clears its graph edges.
    pub fn release_all(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.tables.retain(|_, lock| {
            lock.shared.remove(&session);
            if lock.exclusive == Some(session) {
                lock.exclusive = None;
            }
            !lock.is_unlocked()
        });
        state.graph.remove_session(session);
        self.released.notify_all();
    }

    /// Returns true if the session currently holds the given lock, where
    /// an exclusive grant also satisfies a shared query.
    pub fn holds(&self, session: SessionId, table: TableId, mode: LockMode) -> bool {
        let state = self.state.lock();
        let Some(lock) = state.tables.get(&table) else {
            return false;
        };
        match mode {
            LockMode::Shared => {
                lock.shared.contains(&session) || lock.exclusive == Some(session)
            }
            LockMode::Exclusive => lock.exclusive == Some(session),
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

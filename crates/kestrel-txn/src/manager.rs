//! Two-phase-locking transaction manager.
//!
//! Sessions acquire table-level locks per statement (`begin_action`) and
//! hold them to end of transaction. Every row mutation is recorded as a
//! `RowAction` on the session's append-only list; commit applies the list
//! in order under the process-wide commit lock, rollback undoes it in
//! strict reverse. Uncommitted inserts are visible in the indexes but
//! shielded by the writer's exclusive lock.

use crate::locks::{LockMode, LockTable};
use crate::session::{Session, SessionRegistry};
use kestrel_common::{
    ActionKind, KestrelError, Result, Row, RowAction, Scn, ScnClock, SessionId, TableId, Value,
};
use kestrel_index::TableHandle;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub struct TransactionManager {
    clock: ScnClock,
    locks: LockTable,
    sessions: SessionRegistry,
    tables: RwLock<HashMap<TableId, Arc<TableHandle>>>,
    /// Commits serialize behind this lock so commit SCN order equals the
    /// order effects become permanent.
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            clock: ScnClock::new(),
            locks: LockTable::new(),
            sessions: SessionRegistry::new(),
            tables: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Current system-change-number.
    pub fn current_scn(&self) -> Scn {
        self.clock.current()
    }

    pub fn register_table(&self, table: Arc<TableHandle>) {
        self.tables.write().insert(table.id(), table);
    }

    pub fn table(&self, id: TableId) -> Result<Arc<TableHandle>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KestrelError::InvalidParameter {
                name: "table".to_string(),
                value: id.0.to_string(),
            })
    }

    /// Opens a session.
    pub fn connect(&self) -> SessionId {
        self.sessions.create().id()
    }

    /// Closes a session, rolling back any open transaction.
    pub fn disconnect(&self, session: SessionId) -> Result<()> {
        self.rollback(session)?;
        self.sessions.remove(session);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions.get(id)
    }

    /// Enters a transaction, stamping its SCN. Idempotent while active.
    pub fn begin_transaction(&self, session: SessionId) -> Result<()> {
        let session = self.sessions.get(session)?;
        self.check_not_aborted(&session)?;
        if !session.in_transaction() {
            session.begin(self.clock.next());
        }
        Ok(())
    }

    /// Starts a statement: joins (or begins) the transaction, stamps the
    /// action SCN, and takes the statement's declared table locks. Blocks
    /// on conflict; a deadlock closes with this session as victim only
    /// when it is the youngest on the cycle.
    pub fn begin_action(
        &self,
        session: SessionId,
        read_tables: &[TableId],
        write_tables: &[TableId],
    ) -> Result<()> {
        self.begin_transaction(session)?;
        let handle = self.sessions.get(session)?;
        handle.set_action_scn(self.clock.next());

        for &table in write_tables {
            self.locks
                .acquire(session, table, LockMode::Exclusive, &self.sessions)?;
        }
        for &table in read_tables {
            self.locks
                .acquire(session, table, LockMode::Shared, &self.sessions)?;
        }
        Ok(())
    }

    /// Inserts a new row: allocates storage, attaches an `Insert` action,
    /// links the row into every index, and appends to the action list.
    /// The caller must hold the table's exclusive lock via `begin_action`.
    pub fn insert(
        &self,
        session: SessionId,
        table_id: TableId,
        data: Vec<Value>,
    ) -> Result<Arc<Row>> {
        let handle = self.sessions.get(session)?;
        self.check_not_aborted(&handle)?;
        let table = self.table(table_id)?;

        let row = table.new_row(data)?;
        let action = Arc::new(RowAction::new(
            session,
            table_id,
            &row,
            ActionKind::Insert,
            handle.action_scn(),
        ));
        row.set_action(action.clone());

        if let Err(e) = table.index_row(&row) {
            // Duplicate key or worse: free the row again, nothing was
            // recorded.
            row.clear_action();
            table.remove_row(row.pos())?;
            return Err(e);
        }

        handle.push_action(action);
        tracing::debug!(session = session.0, pos = row.pos().0, "insert action");
        Ok(row)
    }

    /// Logically deletes a row: unlinks it from every index and records a
    /// `Delete` action. Row data stays in storage until commit makes the
    /// delete physical. Deleting a row this transaction inserted merges
    /// into a single `InsertDelete` action.
    pub fn delete(&self, session: SessionId, table_id: TableId, row: &Arc<Row>) -> Result<()> {
        let handle = self.sessions.get(session)?;
        self.check_not_aborted(&handle)?;
        let table = self.table(table_id)?;

        match row.action() {
            Some(action) if action.session() == session => match action.kind() {
                ActionKind::Insert => {
                    table.unindex_row(row)?;
                    action.set_kind(ActionKind::InsertDelete);
                    // Second list entry for the same action: LIFO undo
                    // reverts the delete half first.
                    handle.push_action(action);
                }
                other => {
                    return Err(KestrelError::Internal(format!(
                        "row {} already carries a {:?} action",
                        row.pos(),
                        other
                    )))
                }
            },
            Some(action) => {
                // The table lock should have kept other writers out.
                return Err(KestrelError::Internal(format!(
                    "row {} is written by {}",
                    row.pos(),
                    action.session()
                )));
            }
            None => {
                let action = Arc::new(RowAction::new(
                    session,
                    table_id,
                    row,
                    ActionKind::Delete,
                    handle.action_scn(),
                ));
                row.set_action(action.clone());
                table.unindex_row(row)?;
                handle.push_action(action);
            }
        }

        tracing::debug!(session = session.0, pos = row.pos().0, "delete action");
        Ok(())
    }

    /// Records a savepoint, returning its index.
    pub fn savepoint(&self, session: SessionId) -> Result<usize> {
        let handle = self.sessions.get(session)?;
        self.check_not_aborted(&handle)?;
        Ok(handle.push_savepoint(self.clock.next()))
    }

    /// Rolls back to the savepoint at `index`, discarding it and every
    /// later savepoint. The transaction stays active.
    pub fn rollback_savepoint(&self, session: SessionId, index: usize) -> Result<()> {
        let handle = self.sessions.get(session)?;
        let savepoint = handle.take_savepoint(index)?;
        self.rollback_partial(session, savepoint.actions_len, savepoint.scn)
    }

    /// Commits the session's transaction.
    ///
    /// Returns `false` without doing anything when the session was
    /// flagged as a deadlock victim; the caller must roll back. Any error
    /// while applying actions is a `CommitFailure` (fatal).
    pub fn commit(&self, session: SessionId) -> Result<bool> {
        let handle = self.sessions.get(session)?;
        if !handle.in_transaction() {
            return Ok(true);
        }
        if handle.is_aborted() {
            return Ok(false);
        }

        let end_scn;
        {
            let _commit = self.commit_lock.lock();
            end_scn = self.clock.next();
            for action in handle.actions_from(0) {
                self.commit_action(&action)
                    .map_err(|e| KestrelError::CommitFailure(e.to_string()))?;
            }
        }

        handle.finish(end_scn);
        self.locks.release_all(session);
        tracing::debug!(session = session.0, scn = end_scn.0, "transaction committed");
        Ok(true)
    }

    fn commit_action(&self, action: &Arc<RowAction>) -> Result<()> {
        match action.kind() {
            ActionKind::Insert => {
                // The insert becomes permanently visible: detach the
                // action from its row.
                let table = self.table(action.table())?;
                let row = table.row(action.pos())?;
                row.clear_action();
                action.set_kind(ActionKind::None);
            }
            ActionKind::Delete | ActionKind::InsertDelete => {
                // The delete becomes physical.
                let table = self.table(action.table())?;
                table.remove_row(action.pos())?;
                action.set_kind(ActionKind::DeleteFinal);
            }
            // Already applied via an earlier list entry.
            ActionKind::DeleteFinal | ActionKind::None => {}
        }
        Ok(())
    }

    /// Rolls back the whole transaction and releases its locks. The state
    /// afterwards is observably the state before the transaction began.
    pub fn rollback(&self, session: SessionId) -> Result<()> {
        let handle = self.sessions.get(session)?;
        if !handle.in_transaction() {
            return Ok(());
        }

        self.rollback_partial(session, 0, handle.transaction_scn())?;
        let end_scn = self.clock.next();
        handle.finish(end_scn);
        self.locks.release_all(session);
        tracing::debug!(session = session.0, scn = end_scn.0, "transaction rolled back");
        Ok(())
    }

    /// Undoes the action list suffix starting at `from`, in strict
    /// reverse order, and restores the action SCN. Idempotent when `from`
    /// equals the list length. Rows that no longer resolve are skipped;
    /// there is nothing left to undo for them.
    pub fn rollback_partial(&self, session: SessionId, from: usize, scn: Scn) -> Result<()> {
        let handle = self.sessions.get(session)?;
        for action in handle.actions_from(from).iter().rev() {
            self.undo_action(action)?;
        }
        handle.truncate_actions(from);
        handle.set_action_scn(scn);
        Ok(())
    }

    fn undo_action(&self, action: &Arc<RowAction>) -> Result<()> {
        let table = self.table(action.table())?;
        match action.kind() {
            ActionKind::Insert => {
                match table.row(action.pos()) {
                    Ok(row) => {
                        table.unindex_row(&row)?;
                        row.clear_action();
                        table.remove_row(row.pos())?;
                    }
                    Err(KestrelError::RowNotFound { .. }) => {
                        tracing::debug!(pos = action.pos().0, "insert undo: row already gone");
                    }
                    Err(e) => return Err(e),
                }
                action.set_kind(ActionKind::None);
            }
            ActionKind::Delete => {
                match table.row(action.pos()) {
                    Ok(row) => {
                        row.clear_action();
                        table.index_row(&row)?;
                    }
                    Err(KestrelError::RowNotFound { .. }) => {
                        tracing::debug!(pos = action.pos().0, "delete undo: row not found");
                    }
                    Err(e) => return Err(e),
                }
                action.set_kind(ActionKind::None);
            }
            ActionKind::InsertDelete => {
                // Undo only the delete half; the row returns to its
                // freshly-inserted state. The earlier `Insert` list entry
                // undoes the rest if the rollback reaches it.
                match table.row(action.pos()) {
                    Ok(row) => {
                        table.index_row(&row)?;
                        action.set_kind(ActionKind::Insert);
                        row.set_action(action.clone());
                    }
                    Err(KestrelError::RowNotFound { .. }) => {
                        action.set_kind(ActionKind::None);
                    }
                    Err(e) => return Err(e),
                }
            }
            ActionKind::DeleteFinal | ActionKind::None => {}
        }
        Ok(())
    }

    fn check_not_aborted(&self, session: &Arc<Session>) -> Result<()> {
        if session.is_aborted() {
            return Err(KestrelError::TransactionAborted(format!(
                "{} must roll back",
                session.id()
            )));
        }
        Ok(())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("scn", &self.clock.current())
            .field("sessions", &self.sessions.len())
            .field("tables", &self.tables.read().len())
            .finish()
    }
}

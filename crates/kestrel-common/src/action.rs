//! Shared transaction types: system-change-numbers, sessions, row actions.

use crate::row::{Row, RowPos, TableId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// System-change-number: a monotonically increasing logical clock stamping
/// transaction boundaries. Commit order is SCN order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Scn(pub u64);

impl std::fmt::Display for Scn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scn:{}", self.0)
    }
}

/// Monotonic SCN source.
#[derive(Debug)]
pub struct ScnClock {
    counter: AtomicU64,
}

impl ScnClock {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Advances the clock and returns the new SCN.
    pub fn next(&self) -> Scn {
        Scn(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Current SCN without advancing.
    pub fn current(&self) -> Scn {
        Scn(self.counter.load(Ordering::SeqCst))
    }
}

impl Default for ScnClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a session (one thread of control / connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Kind of pending mutation a RowAction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Row inserted by the owning transaction; not yet committed.
    Insert,
    /// Row logically deleted: unlinked from indexes, data retained.
    Delete,
    /// Row inserted and then deleted within the same transaction.
    InsertDelete,
    /// Delete has been made physical at commit.
    DeleteFinal,
    /// Action consumed; no pending state.
    None,
}

/// A pending, not-yet-committed mutation attached to a row.
///
/// Created when a session inserts or deletes a row, consumed exactly once
/// by commit or rollback, then detached from the row. The row reference is
/// weak: the session's action list owns the action, the cache owns the
/// row, and a row that has been evicted is re-materialized by position.
pub struct RowAction {
    session: SessionId,
    table: TableId,
    pos: RowPos,
    scn: Scn,
    kind: Mutex<ActionKind>,
    row: Mutex<Weak<Row>>,
}

impl RowAction {
    pub fn new(
        session: SessionId,
        table: TableId,
        row: &Arc<Row>,
        kind: ActionKind,
        scn: Scn,
    ) -> Self {
        Self {
            session,
            table,
            pos: row.pos(),
            scn,
            kind: Mutex::new(kind),
            row: Mutex::new(Arc::downgrade(row)),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn pos(&self) -> RowPos {
        self.pos
    }

    pub fn scn(&self) -> Scn {
        self.scn
    }

    pub fn kind(&self) -> ActionKind {
        *self.kind.lock()
    }

    pub fn set_kind(&self, kind: ActionKind) {
        *self.kind.lock() = kind;
    }

    /// The target row, if it is still alive in memory.
    pub fn row(&self) -> Option<Arc<Row>> {
        self.row.lock().upgrade()
    }

    /// Re-points the action at a re-materialized copy of its row.
    pub fn set_row(&self, row: &Arc<Row>) {
        *self.row.lock() = Arc::downgrade(row);
    }
}

impl std::fmt::Debug for RowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowAction")
            .field("session", &self.session)
            .field("table", &self.table)
            .field("pos", &self.pos)
            .field("kind", &self.kind())
            .field("scn", &self.scn)
            .finish()
    }
}

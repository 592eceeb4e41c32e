//! Row representation: identity, cache state, and per-index node links.

use crate::action::RowAction;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Placement handle of a row: a file offset for disk-backed tables or a
/// synthetic id for memory tables. Stable for the row's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowPos(pub u64);

impl RowPos {
    /// Sentinel meaning "no row" (absent tree link, unset root).
    pub const NO_POS: RowPos = RowPos(u64::MAX);

    /// Returns true if this is a real position.
    pub fn is_valid(&self) -> bool {
        *self != Self::NO_POS
    }
}

impl std::fmt::Display for RowPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "pos:{}", self.0)
        } else {
            write!(f, "pos:none")
        }
    }
}

/// Identifier of a table definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u64);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Identifier of an index within its owning table. Doubles as the slot
/// number of the row's node record for that index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId(pub usize);

/// AVL node links for one index, stored inline in the owning row.
///
/// Relationships between nodes are positions only, resolved through the
/// row cache at traversal time; nodes never hold direct references to each
/// other because either side may be evicted independently.
pub struct NodeLinks {
    left: AtomicU64,
    right: AtomicU64,
    parent: AtomicU64,
    /// AVL balance factor: height(right) - height(left), in {-1, 0, 1}
    /// between operations. Transiently reaches +/-2 before a rotation.
    balance: AtomicI8,
}

impl NodeLinks {
    /// Creates detached links (no parent, no children, balance 0).
    pub fn new() -> Self {
        Self {
            left: AtomicU64::new(RowPos::NO_POS.0),
            right: AtomicU64::new(RowPos::NO_POS.0),
            parent: AtomicU64::new(RowPos::NO_POS.0),
            balance: AtomicI8::new(0),
        }
    }

    pub fn left(&self) -> RowPos {
        RowPos(self.left.load(Ordering::Acquire))
    }

    pub fn right(&self) -> RowPos {
        RowPos(self.right.load(Ordering::Acquire))
    }

    pub fn parent(&self) -> RowPos {
        RowPos(self.parent.load(Ordering::Acquire))
    }

    pub fn balance(&self) -> i8 {
        self.balance.load(Ordering::Acquire)
    }

    pub fn set_left(&self, pos: RowPos) {
        self.left.store(pos.0, Ordering::Release);
    }

    pub fn set_right(&self, pos: RowPos) {
        self.right.store(pos.0, Ordering::Release);
    }

    pub fn set_parent(&self, pos: RowPos) {
        self.parent.store(pos.0, Ordering::Release);
    }

    pub fn set_balance(&self, balance: i8) {
        self.balance.store(balance, Ordering::Release);
    }

    /// Returns true if this node has neither children nor a parent.
    pub fn is_detached(&self) -> bool {
        !self.left().is_valid() && !self.right().is_valid() && !self.parent().is_valid()
    }

    /// Detaches the node: clears all links and the balance factor.
    pub fn reset(&self) {
        self.set_left(RowPos::NO_POS);
        self.set_right(RowPos::NO_POS);
        self.set_parent(RowPos::NO_POS);
        self.set_balance(0);
    }
}

impl Default for NodeLinks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLinks")
            .field("left", &self.left())
            .field("right", &self.right())
            .field("parent", &self.parent())
            .field("balance", &self.balance())
            .finish()
    }
}

/// Cache bookkeeping embedded in each row.
pub struct CacheState {
    /// Number of in-flight structural operations holding this row.
    pin_count: AtomicU32,
    /// Whether the row (data or node links) differs from storage.
    dirty: AtomicBool,
    /// Whether the row is currently held by the cache map.
    resident: AtomicBool,
    /// Access-clock snapshot taken at the last (batched) touch.
    access: AtomicU64,
}

impl CacheState {
    pub fn new() -> Self {
        Self {
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            resident: AtomicBool::new(false),
            access: AtomicU64::new(0),
        }
    }

    /// Pins the row, preventing eviction. Returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Unpins the row. Returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::Release);
    }

    /// Last recorded access-clock snapshot.
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access.load(Ordering::Relaxed)
    }

    /// Refreshes the access snapshot, but only when the clock has advanced
    /// by at least `batch` since the previous snapshot. Batching trades
    /// exact LRU ordering for less write traffic on hot entries.
    #[inline]
    pub fn touch(&self, clock: u64, batch: u64) {
        let snapshot = self.access.load(Ordering::Relaxed);
        if clock.saturating_sub(snapshot) >= batch {
            self.access.store(clock, Ordering::Relaxed);
        }
    }

    /// Unconditionally sets the access snapshot (used to push pinned
    /// entries back in the eviction order).
    #[inline]
    pub fn set_access_count(&self, clock: u64) {
        self.access.store(clock, Ordering::Relaxed);
    }
}

impl Default for CacheState {
    fn default() -> Self {
        Self::new()
    }
}

/// A row: an immutable tuple of column values plus identity, node links
/// for each index on its table, cache state, and an optional in-flight
/// transactional action.
pub struct Row {
    table: TableId,
    pos: RowPos,
    data: Vec<Value>,
    nodes: Vec<NodeLinks>,
    cache: CacheState,
    action: Mutex<Option<Arc<RowAction>>>,
}

impl Row {
    /// Creates a row with detached node links for `index_count` indexes.
    pub fn new(table: TableId, pos: RowPos, data: Vec<Value>, index_count: usize) -> Self {
        Self {
            table,
            pos,
            data,
            nodes: (0..index_count).map(|_| NodeLinks::new()).collect(),
            cache: CacheState::new(),
            action: Mutex::new(None),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn pos(&self) -> RowPos {
        self.pos
    }

    pub fn data(&self) -> &[Value] {
        &self.data
    }

    /// Node links for the index occupying the given slot.
    pub fn node(&self, slot: IndexId) -> Option<&NodeLinks> {
        self.nodes.get(slot.0)
    }

    /// Number of node slots (one per index on the owning table).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn cache_state(&self) -> &CacheState {
        &self.cache
    }

    /// Byte footprint used for cache capacity accounting: value payloads
    /// plus one fixed-size node record per index.
    pub fn storage_size(&self) -> usize {
        let values: usize = self.data.iter().map(Value::storage_size).sum();
        values + self.nodes.len() * NODE_RECORD_SIZE
    }

    /// The in-flight action attached to this row, if any.
    pub fn action(&self) -> Option<Arc<RowAction>> {
        self.action.lock().clone()
    }

    /// Attaches an in-flight action. The previous action, if any, is
    /// returned so the caller can merge insert-then-delete sequences.
    pub fn set_action(&self, action: Arc<RowAction>) -> Option<Arc<RowAction>> {
        self.action.lock().replace(action)
    }

    /// Detaches the action after commit or rollback.
    pub fn clear_action(&self) -> Option<Arc<RowAction>> {
        self.action.lock().take()
    }
}

/// Serialized size of one node record: left/right/parent u64 + balance i8.
pub const NODE_RECORD_SIZE: usize = 25;

impl PartialEq for Row {
    /// Two rows are equal iff they belong to the same table and occupy the
    /// same position.
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.pos == other.pos
    }
}

impl Eq for Row {}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row")
            .field("table", &self.table)
            .field("pos", &self.pos)
            .field("columns", &self.data.len())
            .field("pinned", &self.cache.is_pinned())
            .field("dirty", &self.cache.is_dirty())
            .finish()
    }
}

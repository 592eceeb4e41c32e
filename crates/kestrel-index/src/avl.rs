//! Disk-backed AVL index.
//!
//! Nodes are the rows themselves: each row carries one `NodeLinks` record
//! per index on its table, holding left/right/parent positions and the
//! balance factor. Relationships are positions only; every traversal step
//! resolves a position through the cache, materializing evicted rows from
//! storage on demand. Rows touched by a structural change are pinned for
//! the duration so eviction cannot pull a half-relinked node out from
//! under the operation.
//!
//! Balance convention: `height(right) - height(left)`, in `{-1, 0, 1}`
//! between operations.

use crate::resolver::{PinGuard, RowResolver};
use kestrel_common::{
    IndexId, KestrelError, NodeLinks, Result, Row, RowComparator, RowPos, Value,
};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// An AVL index over one table's rows.
///
/// The index holds no node storage of its own, only the root position and
/// the comparator. Writers are expected to be serialized by the
/// transaction layer's table locks; the index itself does not latch.
pub struct AvlIndex {
    /// Node slot this index occupies in each row.
    slot: IndexId,
    comparator: RowComparator,
    unique: bool,
    resolver: Arc<RowResolver>,
    root: AtomicU64,
    len: AtomicUsize,
}

impl AvlIndex {
    pub fn new(
        slot: IndexId,
        comparator: RowComparator,
        unique: bool,
        resolver: Arc<RowResolver>,
    ) -> Self {
        Self {
            slot,
            comparator,
            unique,
            resolver,
            root: AtomicU64::new(RowPos::NO_POS.0),
            len: AtomicUsize::new(0),
        }
    }

    pub fn slot(&self) -> IndexId {
        self.slot
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn comparator(&self) -> &RowComparator {
        &self.comparator
    }

    /// Position of the root node, `NO_POS` when empty.
    pub fn root(&self) -> RowPos {
        RowPos(self.root.load(AtomicOrdering::Acquire))
    }

    fn set_root(&self, pos: RowPos) {
        self.root.store(pos.0, AtomicOrdering::Release);
    }

    /// Number of rows in the index.
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, pos: RowPos) -> Result<Arc<Row>> {
        self.resolver.resolve_node(pos, self.slot)
    }

    fn links<'a>(&self, row: &'a Row) -> Result<&'a NodeLinks> {
        row.node(self.slot)
            .ok_or_else(|| KestrelError::StructuralCorruption {
                pos: row.pos().0,
                reason: format!("row has no node slot {}", self.slot.0),
            })
    }

    fn mark_dirty(&self, row: &Row) {
        row.cache_state().set_dirty(true);
    }

    /// Placement ordering. Non-unique indexes tie-break equal keys on row
    /// position so in-order traversal is strictly ordered.
    fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        let ord = self.comparator.compare_full(a.data(), b.data());
        if ord == Ordering::Equal && !self.unique {
            a.pos().cmp(&b.pos())
        } else {
            ord
        }
    }

    /// Links `row` into the tree and rebalances.
    ///
    /// `DuplicateKey` when a unique index already holds the full key; in
    /// that case the tree is unchanged.
    pub fn insert(&self, row: &Arc<Row>) -> Result<()> {
        let _pin = PinGuard::new(row.clone());
        let row_links = self.links(row)?;
        if !row_links.is_detached() || self.root() == row.pos() {
            return Err(KestrelError::Internal(format!(
                "row {} is already linked in index {}",
                row.pos(),
                self.slot.0
            )));
        }

        let root = self.root();
        if !root.is_valid() {
            self.set_root(row.pos());
            self.mark_dirty(row);
            self.len.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(());
        }

        let mut current = self.resolve(root)?;
        loop {
            let _cur_pin = PinGuard::new(current.clone());
            let ord = self.compare_rows(row, &current);
            if ord == Ordering::Equal {
                return Err(KestrelError::DuplicateKey);
            }

            let next = {
                let links = self.links(&current)?;
                if ord == Ordering::Less {
                    links.left()
                } else {
                    links.right()
                }
            };
            if next.is_valid() {
                current = self.resolve(next)?;
                continue;
            }

            let links = self.links(&current)?;
            if ord == Ordering::Less {
                links.set_left(row.pos());
            } else {
                links.set_right(row.pos());
            }
            row_links.set_parent(current.pos());
            self.mark_dirty(&current);
            self.mark_dirty(row);
            break;
        }

        self.len.fetch_add(1, AtomicOrdering::Relaxed);
        self.rebalance_after_insert(row.clone())
    }

    /// Unlinks `row` from the tree and rebalances. Deleting a row that is
    /// not linked in this index is a no-op.
    pub fn delete(&self, row: &Arc<Row>) -> Result<()> {
        let _pin = PinGuard::new(row.clone());
        let row_links = self.links(row)?;
        if row_links.is_detached() && self.root() != row.pos() {
            return Ok(());
        }

        if row_links.left().is_valid() && row_links.right().is_valid() {
            self.swap_with_successor(row)?;
        }

        // At most one child now.
        let child_pos = if row_links.left().is_valid() {
            row_links.left()
        } else {
            row_links.right()
        };
        let parent_pos = row_links.parent();

        let mut from_left = false;
        if parent_pos.is_valid() {
            let parent = self.resolve(parent_pos)?;
            let plinks = self.links(&parent)?;
            if plinks.left() == row.pos() {
                from_left = true;
                plinks.set_left(child_pos);
            } else if plinks.right() == row.pos() {
                plinks.set_right(child_pos);
            } else {
                return Err(KestrelError::StructuralCorruption {
                    pos: parent_pos.0,
                    reason: format!("parent does not link back to {}", row.pos()),
                });
            }
            self.mark_dirty(&parent);
        } else {
            self.set_root(child_pos);
        }

        if child_pos.is_valid() {
            let child = self.resolve(child_pos)?;
            self.links(&child)?.set_parent(parent_pos);
            self.mark_dirty(&child);
        }

        row_links.reset();
        self.mark_dirty(row);
        self.len.fetch_sub(1, AtomicOrdering::Relaxed);

        if parent_pos.is_valid() {
            self.rebalance_after_delete(parent_pos, from_left)?;
        }
        Ok(())
    }

    /// Structurally exchanges a two-child node with its in-order
    /// successor, so the node ends up with at most one child. Balance
    /// factors travel with the tree position, not the row.
    fn swap_with_successor(&self, node: &Arc<Row>) -> Result<()> {
        let nlinks = self.links(node)?;

        let mut succ = self.resolve(nlinks.right())?;
        loop {
            let left = self.links(&succ)?.left();
            if !left.is_valid() {
                break;
            }
            succ = self.resolve(left)?;
        }
        let _pin = PinGuard::new(succ.clone());
        let slinks = self.links(&succ)?;

        let n_parent = nlinks.parent();
        let n_left = nlinks.left();
        let n_right = nlinks.right();
        let n_balance = nlinks.balance();
        let s_parent = slinks.parent();
        let s_right = slinks.right();
        let s_balance = slinks.balance();

        // Successor takes the node's place.
        self.replace_child(n_parent, node.pos(), succ.pos())?;
        slinks.set_parent(n_parent);
        slinks.set_left(n_left);
        slinks.set_balance(n_balance);
        let left_child = self.resolve(n_left)?;
        self.links(&left_child)?.set_parent(succ.pos());
        self.mark_dirty(&left_child);

        // The node takes the successor's place.
        nlinks.set_balance(s_balance);
        nlinks.set_left(RowPos::NO_POS);
        nlinks.set_right(s_right);
        if s_right.is_valid() {
            let s_right_child = self.resolve(s_right)?;
            self.links(&s_right_child)?.set_parent(node.pos());
            self.mark_dirty(&s_right_child);
        }

        if s_parent == node.pos() {
            // Successor was the node's direct right child.
            slinks.set_right(node.pos());
            nlinks.set_parent(succ.pos());
        } else {
            slinks.set_right(n_right);
            let right_child = self.resolve(n_right)?;
            self.links(&right_child)?.set_parent(succ.pos());
            self.mark_dirty(&right_child);

            // Successor was the leftmost descendant: it was its parent's
            // left child.
            let s_parent_row = self.resolve(s_parent)?;
            self.links(&s_parent_row)?.set_left(node.pos());
            self.mark_dirty(&s_parent_row);
            nlinks.set_parent(s_parent);
        }

        self.mark_dirty(node);
        self.mark_dirty(&succ);
        Ok(())
    }

    /// Re-points the `old` child of `parent_pos` at `new`. An invalid
    /// parent position means `old` was the root.
    fn replace_child(&self, parent_pos: RowPos, old: RowPos, new: RowPos) -> Result<()> {
        if !parent_pos.is_valid() {
            self.set_root(new);
            return Ok(());
        }
        let parent = self.resolve(parent_pos)?;
        let plinks = self.links(&parent)?;
        if plinks.left() == old {
            plinks.set_left(new);
        } else if plinks.right() == old {
            plinks.set_right(new);
        } else {
            return Err(KestrelError::StructuralCorruption {
                pos: parent_pos.0,
                reason: format!("parent does not link back to {}", old),
            });
        }
        self.mark_dirty(&parent);
        Ok(())
    }

    /// Walks from the freshly linked leaf toward the root, updating
    /// balance factors. Stops after the first rotation or when an update
    /// yields 0 (subtree height unchanged from there up).
    fn rebalance_after_insert(&self, mut child: Arc<Row>) -> Result<()> {
        loop {
            let parent_pos = self.links(&child)?.parent();
            if !parent_pos.is_valid() {
                return Ok(());
            }
            let parent = self.resolve(parent_pos)?;
            let _pin = PinGuard::new(parent.clone());
            let plinks = self.links(&parent)?;

            let delta = if plinks.left() == child.pos() { -1 } else { 1 };
            match plinks.balance() + delta {
                0 => {
                    plinks.set_balance(0);
                    self.mark_dirty(&parent);
                    return Ok(());
                }
                b @ (-1 | 1) => {
                    plinks.set_balance(b);
                    self.mark_dirty(&parent);
                    child = parent;
                }
                2 => {
                    self.fix_right_heavy(&parent)?;
                    return Ok(());
                }
                -2 => {
                    self.fix_left_heavy(&parent)?;
                    return Ok(());
                }
                b => {
                    return Err(KestrelError::Internal(format!(
                        "balance factor {} out of range at {}",
                        b, parent_pos
                    )))
                }
            }
        }
    }

    /// Walks from the unlink point toward the root. Deletion can shrink
    /// each subtree on the path, so the walk continues while the fixed
    /// subtree's height actually decreased.
    fn rebalance_after_delete(&self, mut pos: RowPos, mut from_left: bool) -> Result<()> {
        while pos.is_valid() {
            let node = self.resolve(pos)?;
            let _pin = PinGuard::new(node.clone());
            let nlinks = self.links(&node)?;

            let parent_pos = nlinks.parent();
            let parent_from_left = if parent_pos.is_valid() {
                let parent = self.resolve(parent_pos)?;
                self.links(&parent)?.left() == pos
            } else {
                false
            };

            let delta = if from_left { 1 } else { -1 };
            let shrank = match nlinks.balance() + delta {
                0 => {
                    nlinks.set_balance(0);
                    self.mark_dirty(&node);
                    true
                }
                b @ (-1 | 1) => {
                    nlinks.set_balance(b);
                    self.mark_dirty(&node);
                    false
                }
                2 => self.fix_right_heavy(&node)?,
                -2 => self.fix_left_heavy(&node)?,
                b => {
                    return Err(KestrelError::Internal(format!(
                        "balance factor {} out of range at {}",
                        b, pos
                    )))
                }
            };

            if !shrank {
                return Ok(());
            }
            pos = parent_pos;
            from_left = parent_from_left;
        }
        Ok(())
    }

    /// Fixes a transiently +2 (right-heavy) node. Returns whether the
    /// subtree height shrank relative to before the rotation.
    fn fix_right_heavy(&self, node: &Arc<Row>) -> Result<bool> {
        let nlinks = self.links(node)?;
        let child = self.resolve(nlinks.right())?;
        let _pin = PinGuard::new(child.clone());
        let clinks = self.links(&child)?;
        let child_balance = clinks.balance();

        if child_balance >= 0 {
            // Same-sign (or level) child: single left rotation.
            self.rotate_left(node, &child)?;
            if child_balance == 0 {
                // Delete-only case: height is preserved.
                nlinks.set_balance(1);
                clinks.set_balance(-1);
                Ok(false)
            } else {
                nlinks.set_balance(0);
                clinks.set_balance(0);
                Ok(true)
            }
        } else {
            // Opposite-sign child: double rotation through the grandchild.
            let grand = self.resolve(clinks.left())?;
            let _gpin = PinGuard::new(grand.clone());
            let glinks = self.links(&grand)?;
            let grand_balance = glinks.balance();

            self.rotate_right(&child, &grand)?;
            self.rotate_left(node, &grand)?;

            nlinks.set_balance(if grand_balance == 1 { -1 } else { 0 });
            clinks.set_balance(if grand_balance == -1 { 1 } else { 0 });
            glinks.set_balance(0);
            Ok(true)
        }
    }

    /// Mirror of [`fix_right_heavy`] for a -2 (left-heavy) node.
    fn fix_left_heavy(&self, node: &Arc<Row>) -> Result<bool> {
        let nlinks = self.links(node)?;
        let child = self.resolve(nlinks.left())?;
        let _pin = PinGuard::new(child.clone());
        let clinks = self.links(&child)?;
        let child_balance = clinks.balance();

        if child_balance <= 0 {
            self.rotate_right(node, &child)?;
            if child_balance == 0 {
                nlinks.set_balance(-1);
                clinks.set_balance(1);
                Ok(false)
            } else {
                nlinks.set_balance(0);
                clinks.set_balance(0);
                Ok(true)
            }
        } else {
            let grand = self.resolve(clinks.right())?;
            let _gpin = PinGuard::new(grand.clone());
            let glinks = self.links(&grand)?;
            let grand_balance = glinks.balance();

            self.rotate_left(&child, &grand)?;
            self.rotate_right(node, &grand)?;

            nlinks.set_balance(if grand_balance == -1 { 1 } else { 0 });
            clinks.set_balance(if grand_balance == 1 { -1 } else { 0 });
            glinks.set_balance(0);
            Ok(true)
        }
    }

    /// Left rotation: `child` (the right child of `node`) becomes the
    /// subtree root. Balance factors are the caller's responsibility.
    fn rotate_left(&self, node: &Arc<Row>, child: &Arc<Row>) -> Result<()> {
        let nlinks = self.links(node)?;
        let clinks = self.links(child)?;

        let inner = clinks.left();
        nlinks.set_right(inner);
        if inner.is_valid() {
            let inner_row = self.resolve(inner)?;
            self.links(&inner_row)?.set_parent(node.pos());
            self.mark_dirty(&inner_row);
        }

        let parent = nlinks.parent();
        self.replace_child(parent, node.pos(), child.pos())?;
        clinks.set_parent(parent);
        clinks.set_left(node.pos());
        nlinks.set_parent(child.pos());

        self.mark_dirty(node);
        self.mark_dirty(child);
        Ok(())
    }

    /// Right rotation: `child` (the left child of `node`) becomes the
    /// subtree root.
    fn rotate_right(&self, node: &Arc<Row>, child: &Arc<Row>) -> Result<()> {
        let nlinks = self.links(node)?;
        let clinks = self.links(child)?;

        let inner = clinks.right();
        nlinks.set_left(inner);
        if inner.is_valid() {
            let inner_row = self.resolve(inner)?;
            self.links(&inner_row)?.set_parent(node.pos());
            self.mark_dirty(&inner_row);
        }

        let parent = nlinks.parent();
        self.replace_child(parent, node.pos(), child.pos())?;
        clinks.set_parent(parent);
        clinks.set_right(node.pos());
        nlinks.set_parent(child.pos());

        self.mark_dirty(node);
        self.mark_dirty(child);
        Ok(())
    }

    /// Returns true if `row` is linked in this index.
    pub fn contains(&self, row: &Arc<Row>) -> Result<bool> {
        let mut pos = self.root();
        while pos.is_valid() {
            if pos == row.pos() {
                return Ok(true);
            }
            let current = self.resolve(pos)?;
            let links = self.links(&current)?;
            pos = match self.compare_rows(row, &current) {
                Ordering::Less => links.left(),
                Ordering::Greater => links.right(),
                // Equal key at a different position: only possible on a
                // unique index, and then some other row owns the key.
                Ordering::Equal => return Ok(false),
            };
        }
        Ok(false)
    }

    /// Smallest row in index order, `None` when empty.
    pub fn first_row(&self) -> Result<Option<Arc<Row>>> {
        let root = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut current = self.resolve(root)?;
        loop {
            let left = self.links(&current)?.left();
            if !left.is_valid() {
                return Ok(Some(current));
            }
            current = self.resolve(left)?;
        }
    }

    /// Largest row in index order, `None` when empty.
    pub fn last_row(&self) -> Result<Option<Arc<Row>>> {
        let root = self.root();
        if !root.is_valid() {
            return Ok(None);
        }
        let mut current = self.resolve(root)?;
        loop {
            let right = self.links(&current)?.right();
            if !right.is_valid() {
                return Ok(Some(current));
            }
            current = self.resolve(right)?;
        }
    }

    /// In-order position of the next row after `row`, `NO_POS` at the end.
    fn successor(&self, row: &Row) -> Result<RowPos> {
        let links = self.links(row)?;
        let right = links.right();
        if right.is_valid() {
            let mut current = self.resolve(right)?;
            loop {
                let left = self.links(&current)?.left();
                if !left.is_valid() {
                    return Ok(current.pos());
                }
                current = self.resolve(left)?;
            }
        }

        // Climb until we arrive from a left child.
        let mut child_pos = row.pos();
        let mut parent_pos = links.parent();
        while parent_pos.is_valid() {
            let parent = self.resolve(parent_pos)?;
            let plinks = self.links(&parent)?;
            if plinks.left() == child_pos {
                return Ok(parent_pos);
            }
            child_pos = parent_pos;
            parent_pos = plinks.parent();
        }
        Ok(RowPos::NO_POS)
    }

    /// Ascending traversal over the whole index.
    pub fn iter(&self) -> Result<IndexCursor<'_>> {
        let start = match self.first_row()? {
            Some(row) => row.pos(),
            None => RowPos::NO_POS,
        };
        Ok(IndexCursor {
            index: self,
            next: start,
            bound: None,
        })
    }

    /// Ordered cursor over every row whose first `match_count` key columns
    /// equal `key`. The cursor is empty when nothing matches.
    pub fn find_first_row(&self, key: &[Value], match_count: usize) -> Result<IndexCursor<'_>> {
        let count = match_count.min(self.comparator.key_len());

        let mut pos = self.root();
        let mut best = RowPos::NO_POS;
        while pos.is_valid() {
            let row = self.resolve(pos)?;
            let links = self.links(&row)?;
            pos = match self.comparator.compare(key, row.data(), count) {
                Ordering::Greater => links.right(),
                // Equal keys keep descending left: ties continue toward
                // the leftmost match.
                Ordering::Equal => {
                    best = row.pos();
                    links.left()
                }
                Ordering::Less => links.left(),
            };
        }

        Ok(IndexCursor {
            index: self,
            next: best,
            bound: Some((key.to_vec(), count)),
        })
    }
}

impl std::fmt::Debug for AvlIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvlIndex")
            .field("slot", &self.slot.0)
            .field("unique", &self.unique)
            .field("len", &self.len())
            .field("root", &self.root())
            .finish()
    }
}

/// Forward cursor over an [`AvlIndex`], optionally bounded to a key
/// prefix. Rows are resolved lazily; an unresolvable link ends the
/// traversal with the error.
pub struct IndexCursor<'a> {
    index: &'a AvlIndex,
    next: RowPos,
    bound: Option<(Vec<Value>, usize)>,
}

impl IndexCursor<'_> {
    /// Advances and returns the next row, or `None` past the end.
    pub fn next_row(&mut self) -> Result<Option<Arc<Row>>> {
        if !self.next.is_valid() {
            return Ok(None);
        }
        let row = self.index.resolve(self.next)?;

        if let Some((key, count)) = &self.bound {
            if self
                .index
                .comparator
                .compare(key, row.data(), *count)
                != Ordering::Equal
            {
                self.next = RowPos::NO_POS;
                return Ok(None);
            }
        }

        self.next = self.index.successor(&row)?;
        Ok(Some(row))
    }
}

impl Iterator for IndexCursor<'_> {
    type Item = Result<Arc<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                self.next = RowPos::NO_POS;
                Some(Err(e))
            }
        }
    }
}

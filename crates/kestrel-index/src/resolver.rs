//! Position-to-row resolution through the cache and row store.

use crate::codec::RowCodec;
use crate::store::RowStore;
use kestrel_cache::{RowCache, RowWriter};
use kestrel_common::{IndexId, KestrelError, Result, Row, RowPos, TableId};
use std::sync::Arc;

/// Write-back sink used by the cache: encodes the row and rewrites its
/// record in place. Holds no cache reference, so eviction cannot re-enter
/// the cache.
pub struct StoreWriter {
    store: Arc<dyn RowStore>,
    codec: RowCodec,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            codec: RowCodec::new(),
        }
    }
}

impl RowWriter for StoreWriter {
    fn write_row(&self, row: &Row) -> Result<()> {
        let bytes = self.codec.encode(row)?;
        self.store.write_row(row.pos(), &bytes)
    }
}

/// Resolves row positions to in-memory rows: cache hit, or materialize
/// from the store and insert into the cache.
///
/// There is at most one live instance per position; on a racing
/// materialization the cache's copy wins so node-link mutations are never
/// split across duplicates.
pub struct RowResolver {
    table: TableId,
    cache: Arc<RowCache>,
    store: Arc<dyn RowStore>,
    codec: RowCodec,
}

impl RowResolver {
    pub fn new(table: TableId, cache: Arc<RowCache>, store: Arc<dyn RowStore>) -> Self {
        Self {
            table,
            cache,
            store,
            codec: RowCodec::new(),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Resolves `pos` to its row, reading and decoding from storage on a
    /// cache miss.
    pub fn resolve(&self, pos: RowPos) -> Result<Arc<Row>> {
        if let Some(row) = self.cache.lookup(pos) {
            return Ok(row);
        }

        let bytes = self.store.read_row(pos)?;
        let row = Arc::new(self.codec.decode(self.table, pos, &bytes)?);
        self.cache.put(row.clone());

        // A concurrent resolve may have inserted first; use whichever
        // instance the cache holds.
        Ok(self.cache.lookup(pos).unwrap_or(row))
    }

    /// Resolves a node link for the given index slot. A link that does not
    /// resolve to a row carrying that slot means the tree structure can no
    /// longer be trusted.
    pub fn resolve_node(&self, pos: RowPos, slot: IndexId) -> Result<Arc<Row>> {
        let row = self.resolve(pos).map_err(|e| match e {
            e if e.is_fatal() => e,
            e => {
                tracing::error!(pos = pos.0, slot = slot.0, cause = %e, "dangling node link");
                KestrelError::StructuralCorruption {
                    pos: pos.0,
                    reason: e.to_string(),
                }
            }
        })?;

        if row.node(slot).is_none() {
            tracing::error!(pos = pos.0, slot = slot.0, "node link to row without index slot");
            return Err(KestrelError::StructuralCorruption {
                pos: pos.0,
                reason: format!("row has no node slot {}", slot.0),
            });
        }
        Ok(row)
    }
}

/// RAII pin on a row, keeping it resident for the guard's lifetime.
pub struct PinGuard {
    row: Arc<Row>,
}

impl PinGuard {
    pub fn new(row: Arc<Row>) -> Self {
        row.cache_state().pin();
        Self { row }
    }

    pub fn row(&self) -> &Arc<Row> {
        &self.row
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.row.cache_state().unpin();
    }
}

//! Table seam: one row store, one cache, and the table's index set.

use crate::avl::AvlIndex;
use crate::codec::RowCodec;
use crate::resolver::{RowResolver, StoreWriter};
use crate::store::{FileRowStore, MemRowStore, RowStore, StorageMode};
use kestrel_cache::RowCache;
use kestrel_common::{
    CacheConfig, Result, Row, RowComparator, RowPos, StoreConfig, TableId, Value,
};
use kestrel_common::IndexId;
use std::sync::Arc;

/// Definition of one index at table creation.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub comparator: RowComparator,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique(comparator: RowComparator) -> Self {
        Self {
            comparator,
            unique: true,
        }
    }

    pub fn non_unique(comparator: RowComparator) -> Self {
        Self {
            comparator,
            unique: false,
        }
    }
}

/// A table's storage and index surface.
///
/// Owns the row store, the row cache, and the AVL indexes over the
/// table's rows. Exposes only what the transaction layer needs: row
/// creation, index maintenance, and physical removal. Locking is the
/// transaction manager's concern.
pub struct TableHandle {
    id: TableId,
    mode: StorageMode,
    store: Arc<dyn RowStore>,
    cache: Arc<RowCache>,
    resolver: Arc<RowResolver>,
    indexes: Vec<Arc<AvlIndex>>,
    codec: RowCodec,
}

impl TableHandle {
    /// Creates a table with the given storage mode and index set. The
    /// first index is conventionally the primary one.
    pub fn create(
        id: TableId,
        mode: StorageMode,
        store_config: &StoreConfig,
        cache_config: CacheConfig,
        specs: Vec<IndexSpec>,
    ) -> Result<Arc<Self>> {
        let store: Arc<dyn RowStore> = match mode {
            StorageMode::Memory => Arc::new(MemRowStore::new()),
            StorageMode::Cached => Arc::new(FileRowStore::open(store_config, id)?),
        };
        let writer = Arc::new(StoreWriter::new(store.clone()));
        let cache = Arc::new(RowCache::new(cache_config, writer));
        let resolver = Arc::new(RowResolver::new(id, cache.clone(), store.clone()));

        let indexes = specs
            .into_iter()
            .enumerate()
            .map(|(slot, spec)| {
                Arc::new(AvlIndex::new(
                    IndexId(slot),
                    spec.comparator,
                    spec.unique,
                    resolver.clone(),
                ))
            })
            .collect();

        Ok(Arc::new(Self {
            id,
            mode,
            store,
            cache,
            resolver,
            indexes,
            codec: RowCodec::new(),
        }))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<RowResolver> {
        &self.resolver
    }

    pub fn indexes(&self) -> &[Arc<AvlIndex>] {
        &self.indexes
    }

    /// The primary index.
    pub fn primary_index(&self) -> &Arc<AvlIndex> {
        &self.indexes[0]
    }

    pub fn index(&self, slot: usize) -> Option<&Arc<AvlIndex>> {
        self.indexes.get(slot)
    }

    /// Allocates storage for a new tuple, writes its initial record, and
    /// makes the row cache-resident. The row is not yet linked in any
    /// index.
    pub fn new_row(&self, data: Vec<Value>) -> Result<Arc<Row>> {
        let size = RowCodec::encoded_size(&data, self.indexes.len());
        let pos = self.store.allocate(size)?;
        let row = Arc::new(Row::new(self.id, pos, data, self.indexes.len()));

        // Persist the initial record so the position is resolvable even
        // if the row is evicted before its first write-back.
        self.store.write_row(pos, &self.codec.encode(&row)?)?;
        self.cache.put(row.clone());
        Ok(row)
    }

    /// Resolves a position to its row.
    pub fn row(&self, pos: RowPos) -> Result<Arc<Row>> {
        self.resolver.resolve(pos)
    }

    /// Links a row into every index. On failure (duplicate key in a later
    /// index) the already-made links are undone, leaving the row fully
    /// detached.
    pub fn index_row(&self, row: &Arc<Row>) -> Result<()> {
        for (slot, index) in self.indexes.iter().enumerate() {
            if let Err(e) = index.insert(row) {
                for done in &self.indexes[..slot] {
                    done.delete(row)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unlinks a row from every index. The row data stays in storage so a
    /// rollback can relink it.
    pub fn unindex_row(&self, row: &Arc<Row>) -> Result<()> {
        for index in &self.indexes {
            index.delete(row)?;
        }
        Ok(())
    }

    /// Physically removes a row: drops it from the cache without
    /// write-back and frees its storage. The row must already be
    /// unindexed.
    pub fn remove_row(&self, pos: RowPos) -> Result<()> {
        self.cache.release(pos);
        self.store.remove(pos)
    }

    /// Flushes every dirty cached row. Returns the number written.
    pub fn flush(&self) -> Result<usize> {
        let flushed = self.cache.save_all();
        self.store.sync()?;
        Ok(flushed)
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

//! Row cache with access-count eviction and batched write-back.

use kestrel_common::{CacheConfig, KestrelError, Result, Row, RowPos};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Write-back sink for dirty rows, implemented by the storage layer
/// (serialize + write at the row's position).
pub trait RowWriter: Send + Sync {
    fn write_row(&self, row: &Row) -> Result<()>;
}

/// Statistics about the row cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of resident rows.
    pub resident: usize,
    /// Total storage size of resident rows in bytes.
    pub bytes: usize,
    /// Number of resident dirty rows.
    pub dirty: usize,
    /// Number of resident pinned rows.
    pub pinned: usize,
}

/// Bounded cache of deserialized rows keyed by file position.
///
/// This is a pure memory layer: a miss is the caller's problem (the
/// storage layer materializes the row and `put`s it back). Eviction is
/// access-count based: `clean_up` removes roughly the least-recently
/// accessed half, writing dirty victims back in one position-sorted batch.
/// Access counts are refreshed in batches (`access_batch`), so eviction
/// order is approximately, not strictly, LRU.
pub struct RowCache {
    config: CacheConfig,
    /// Global access clock; advanced on every hit and insert.
    clock: AtomicU64,
    writer: Arc<dyn RowWriter>,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    rows: HashMap<RowPos, Arc<Row>>,
    bytes: usize,
}

impl RowCache {
    /// Creates a cache flushing dirty evictees through `writer`.
    pub fn new(config: CacheConfig, writer: Arc<dyn RowWriter>) -> Self {
        Self {
            config,
            clock: AtomicU64::new(0),
            writer,
            inner: Mutex::new(CacheInner {
                rows: HashMap::new(),
                bytes: 0,
            }),
        }
    }

    /// Maximum number of resident rows.
    pub fn capacity(&self) -> usize {
        self.config.max_rows
    }

    /// Number of resident rows.
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().rows.is_empty()
    }

    /// Total storage size of resident rows.
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Number of resident dirty rows.
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .rows
            .values()
            .filter(|r| r.cache_state().is_dirty())
            .count()
    }

    pub fn contains(&self, pos: RowPos) -> bool {
        self.inner.lock().rows.contains_key(&pos)
    }

    /// Returns the cached row if resident, refreshing its access snapshot.
    pub fn lookup(&self, pos: RowPos) -> Option<Arc<Row>> {
        let inner = self.inner.lock();
        let row = inner.rows.get(&pos)?.clone();
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        row.cache_state().touch(now, self.config.access_batch);
        Some(row)
    }

    /// Returns the cached row, or fails if it is not resident. Fetching a
    /// missing row from storage is the storage layer's responsibility.
    pub fn get(&self, pos: RowPos) -> Result<Arc<Row>> {
        self.lookup(pos)
            .ok_or(KestrelError::RowNotResident { pos: pos.0 })
    }

    /// Inserts a row, evicting first if capacity would be exceeded.
    ///
    /// The row is inserted even when cleanup could not free enough space
    /// (e.g. everything is pinned), so capacity can be transiently
    /// exceeded; the next `put` retries cleanup.
    pub fn put(&self, row: Arc<Row>) {
        let pos = row.pos();
        let size = row.storage_size();
        let mut inner = self.inner.lock();

        if inner.rows.contains_key(&pos) {
            return;
        }

        if inner.rows.len() + 1 > self.config.max_rows
            || inner.bytes + size > self.config.max_bytes
        {
            self.clean_up_locked(&mut inner);
            if inner.rows.len() + 1 > self.config.max_rows
                || inner.bytes + size > self.config.max_bytes
            {
                self.force_clean_up_locked(&mut inner);
            }
        }

        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        row.cache_state().set_access_count(now);
        row.cache_state().set_resident(true);
        inner.bytes += size;
        inner.rows.insert(pos, row);
    }

    /// Removes a row without write-back. The caller asserts the row is
    /// unchanged or already flushed.
    pub fn release(&self, pos: RowPos) -> bool {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.remove(&pos) {
            inner.bytes = inner.bytes.saturating_sub(row.storage_size());
            row.cache_state().set_resident(false);
            true
        } else {
            false
        }
    }

    /// Evicts approximately the least-recently-accessed half of the cache.
    /// Returns the number of rows evicted.
    pub fn clean_up(&self) -> usize {
        let mut inner = self.inner.lock();
        self.clean_up_locked(&mut inner)
    }

    fn clean_up_locked(&self, inner: &mut CacheInner) -> usize {
        if inner.rows.is_empty() {
            return 0;
        }

        // Threshold that would remove about half of the entries.
        let mut accesses: Vec<u64> = inner
            .rows
            .values()
            .map(|r| r.cache_state().access_count())
            .collect();
        accesses.sort_unstable();
        let threshold = accesses[accesses.len() / 2];

        let now = self.clock.load(Ordering::Relaxed);
        let mut victims: Vec<Arc<Row>> = Vec::new();
        for row in inner.rows.values() {
            let state = row.cache_state();
            if state.access_count() > threshold {
                continue;
            }
            if state.is_pinned() {
                // Pinned entries survive and are pushed back in the
                // eviction order so a half-deleted node is never reused
                // mid-operation elsewhere.
                state.set_access_count(now);
                continue;
            }
            victims.push(row.clone());
        }

        // Batched write-back, sorted by position for sequential I/O.
        let mut dirty: Vec<&Arc<Row>> = victims
            .iter()
            .filter(|r| r.cache_state().is_dirty())
            .collect();
        dirty.sort_by_key(|r| r.pos());
        for row in dirty {
            match self.writer.write_row(row) {
                Ok(()) => row.cache_state().set_dirty(false),
                Err(e) => {
                    // Stays dirty and resident; retried on the next pass.
                    tracing::warn!(pos = row.pos().0, error = %e, "row write-back failed");
                }
            }
        }

        let mut evicted = 0;
        for row in victims {
            if row.cache_state().is_dirty() {
                continue;
            }
            if inner.rows.remove(&row.pos()).is_some() {
                inner.bytes = inner.bytes.saturating_sub(row.storage_size());
                row.cache_state().set_resident(false);
                evicted += 1;
            }
        }
        evicted
    }

    /// Stronger pass for when `clean_up` freed too little: evicts every
    /// unpinned, clean entry unconditionally. Dirty entries are left for a
    /// later pass rather than written synchronously here, bounding the
    /// latency of the `put` that triggered eviction.
    pub fn force_clean_up(&self) -> usize {
        let mut inner = self.inner.lock();
        self.force_clean_up_locked(&mut inner)
    }

    fn force_clean_up_locked(&self, inner: &mut CacheInner) -> usize {
        let victims: Vec<RowPos> = inner
            .rows
            .values()
            .filter(|r| !r.cache_state().is_pinned() && !r.cache_state().is_dirty())
            .map(|r| r.pos())
            .collect();

        let mut evicted = 0;
        for pos in victims {
            if let Some(row) = inner.rows.remove(&pos) {
                inner.bytes = inner.bytes.saturating_sub(row.storage_size());
                row.cache_state().set_resident(false);
                evicted += 1;
            }
        }
        evicted
    }

    /// Flushes every dirty row, in position order. Used at checkpoint and
    /// shutdown boundaries. Rows whose write fails stay dirty and are
    /// retried on the next pass; returns the number flushed.
    pub fn save_all(&self) -> usize {
        let inner = self.inner.lock();
        let mut dirty: Vec<Arc<Row>> = inner
            .rows
            .values()
            .filter(|r| r.cache_state().is_dirty())
            .cloned()
            .collect();
        dirty.sort_by_key(|r| r.pos());

        let mut flushed = 0;
        for row in dirty {
            match self.writer.write_row(&row) {
                Ok(()) => {
                    row.cache_state().set_dirty(false);
                    flushed += 1;
                }
                Err(e) => {
                    tracing::warn!(pos = row.pos().0, error = %e, "save_all write failed");
                }
            }
        }
        flushed
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut dirty = 0;
        let mut pinned = 0;
        for row in inner.rows.values() {
            if row.cache_state().is_dirty() {
                dirty += 1;
            }
            if row.cache_state().is_pinned() {
                pinned += 1;
            }
        }
        CacheStats {
            resident: inner.rows.len(),
            bytes: inner.bytes,
            dirty,
            pinned,
        }
    }
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RowCache")
            .field("resident", &stats.resident)
            .field("bytes", &stats.bytes)
            .field("capacity", &self.config.max_rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{TableId, Value};
    use std::sync::atomic::AtomicBool;

    /// Test writer recording every write, optionally failing.
    struct RecordingWriter {
        written: Mutex<Vec<RowPos>>,
        fail: AtomicBool,
    }

    impl RecordingWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn written(&self) -> Vec<RowPos> {
            self.written.lock().clone()
        }
    }

    impl RowWriter for RecordingWriter {
        fn write_row(&self, row: &Row) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(KestrelError::Internal("write refused".to_string()));
            }
            self.written.lock().push(row.pos());
            Ok(())
        }
    }

    fn test_row(pos: u64) -> Arc<Row> {
        Arc::new(Row::new(
            TableId(1),
            RowPos(pos),
            vec![Value::Integer(pos as i64)],
            1,
        ))
    }

    fn test_cache(max_rows: usize) -> (RowCache, Arc<RecordingWriter>) {
        let writer = RecordingWriter::new();
        let cache = RowCache::new(CacheConfig::with_capacity(max_rows), writer.clone());
        (cache, writer)
    }

    #[test]
    fn test_cache_put_get() {
        let (cache, _) = test_cache(10);
        let row = test_row(1);

        cache.put(row.clone());
        assert!(cache.contains(RowPos(1)));
        assert!(row.cache_state().is_resident());

        let fetched = cache.get(RowPos(1)).unwrap();
        assert_eq!(*fetched, *row);
    }

    #[test]
    fn test_cache_get_miss_is_error() {
        let (cache, _) = test_cache(10);
        let err = cache.get(RowPos(99)).unwrap_err();
        assert!(matches!(err, KestrelError::RowNotResident { pos: 99 }));
    }

    #[test]
    fn test_cache_put_duplicate_is_noop() {
        let (cache, _) = test_cache(10);
        cache.put(test_row(1));
        cache.put(test_row(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_release_no_writeback() {
        let (cache, writer) = test_cache(10);
        let row = test_row(1);
        row.cache_state().set_dirty(true);
        cache.put(row.clone());

        assert!(cache.release(RowPos(1)));
        assert!(!cache.contains(RowPos(1)));
        assert!(!row.cache_state().is_resident());
        // Release never writes back.
        assert!(writer.written().is_empty());
        assert!(!cache.release(RowPos(1)));
    }

    #[test]
    fn test_cache_capacity_never_exceeded_by_clean_rows() {
        let (cache, _) = test_cache(10);
        for i in 0..100 {
            cache.put(test_row(i));
            assert!(cache.len() <= 10, "resident {} > capacity", cache.len());
        }
    }

    #[test]
    fn test_cache_clean_up_evicts_about_half() {
        let (cache, _) = test_cache(100);
        for i in 0..10 {
            cache.put(test_row(i));
        }

        let evicted = cache.clean_up();
        assert!(evicted >= 4, "evicted only {}", evicted);
        assert!(cache.len() <= 6);
    }

    #[test]
    fn test_cache_clean_up_prefers_cold_entries() {
        let (cache, _) = test_cache(100);
        for i in 0..10 {
            cache.put(test_row(i));
        }
        // Heat up the last two entries.
        for _ in 0..20 {
            cache.lookup(RowPos(8));
            cache.lookup(RowPos(9));
        }

        cache.clean_up();
        assert!(cache.contains(RowPos(8)));
        assert!(cache.contains(RowPos(9)));
    }

    #[test]
    fn test_cache_dirty_eviction_writes_back_sorted() {
        let (cache, writer) = test_cache(100);
        for &i in &[5u64, 1, 9, 3, 7] {
            let row = test_row(i);
            row.cache_state().set_dirty(true);
            cache.put(row);
        }

        cache.clean_up();
        let written = writer.written();
        assert!(!written.is_empty());
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(written, sorted, "write-back not position-sorted");
    }

    #[test]
    fn test_cache_write_failure_keeps_row_dirty_and_resident() {
        let (cache, writer) = test_cache(100);
        let row = test_row(1);
        row.cache_state().set_dirty(true);
        cache.put(row.clone());
        cache.put(test_row(2));

        writer.fail.store(true, Ordering::Relaxed);
        cache.clean_up();

        assert!(row.cache_state().is_dirty());
        assert!(cache.contains(RowPos(1)));

        // Next pass with a healthy writer retries and succeeds.
        writer.fail.store(false, Ordering::Relaxed);
        cache.clean_up();
        assert!(!row.cache_state().is_dirty());
    }

    #[test]
    fn test_cache_pinned_rows_survive_clean_up() {
        let (cache, _) = test_cache(100);
        let pinned = test_row(1);
        pinned.cache_state().pin();
        cache.put(pinned.clone());
        for i in 2..10 {
            cache.put(test_row(i));
        }

        cache.clean_up();
        assert!(cache.contains(RowPos(1)));

        pinned.cache_state().unpin();
    }

    #[test]
    fn test_cache_pinned_rows_survive_force_clean_up() {
        let (cache, _) = test_cache(3);
        let mut rows = Vec::new();
        // Over-fill with all-pinned entries: capacity is exceeded but
        // nothing may be evicted (documented bounded violation window).
        for i in 0..6 {
            let row = test_row(i);
            row.cache_state().pin();
            cache.put(row.clone());
            rows.push(row);
        }

        assert_eq!(cache.len(), 6);
        cache.force_clean_up();
        assert_eq!(cache.len(), 6);

        for row in &rows {
            row.cache_state().unpin();
        }
        cache.force_clean_up();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cache_force_clean_up_leaves_dirty_rows() {
        let (cache, _) = test_cache(10);
        let dirty = test_row(1);
        dirty.cache_state().set_dirty(true);
        cache.put(dirty);
        cache.put(test_row(2));

        cache.force_clean_up();
        assert!(cache.contains(RowPos(1)));
        assert!(!cache.contains(RowPos(2)));
    }

    #[test]
    fn test_cache_save_all_flushes_every_dirty_row() {
        let (cache, writer) = test_cache(100);
        for i in 0..5 {
            let row = test_row(i);
            row.cache_state().set_dirty(true);
            cache.put(row);
        }
        cache.put(test_row(99)); // clean

        let flushed = cache.save_all();
        assert_eq!(flushed, 5);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(writer.written().len(), 5);
    }

    #[test]
    fn test_cache_byte_accounting() {
        let (cache, _) = test_cache(100);
        let row = test_row(1);
        let size = row.storage_size();

        cache.put(row);
        assert_eq!(cache.bytes(), size);

        cache.release(RowPos(1));
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn test_cache_byte_capacity_triggers_eviction() {
        let writer = RecordingWriter::new();
        let row_size = test_row(0).storage_size();
        let config = CacheConfig {
            max_rows: usize::MAX,
            max_bytes: row_size * 4,
            access_batch: 1,
        };
        let cache = RowCache::new(config, writer);

        for i in 0..20 {
            cache.put(test_row(i));
            assert!(cache.bytes() <= row_size * 4);
        }
    }

    #[test]
    fn test_cache_stats() {
        let (cache, _) = test_cache(10);
        let dirty = test_row(1);
        dirty.cache_state().set_dirty(true);
        let pinned = test_row(2);
        pinned.cache_state().pin();
        cache.put(dirty);
        cache.put(pinned.clone());
        cache.put(test_row(3));

        let stats = cache.stats();
        assert_eq!(stats.resident, 3);
        assert_eq!(stats.dirty, 1);
        assert_eq!(stats.pinned, 1);
        assert!(stats.bytes > 0);

        pinned.cache_state().unpin();
    }

    #[test]
    fn test_cache_churn_under_random_access() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let (cache, _) = test_cache(50);

        for _ in 0..2_000 {
            let pos = rng.gen_range(0..500u64);
            if cache.lookup(RowPos(pos)).is_none() {
                cache.put(test_row(pos));
            }
            assert!(cache.len() <= 50);
        }
    }
}

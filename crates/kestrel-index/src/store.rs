//! Row store backends: file-backed records and an in-memory map.

use bytes::{Buf, BufMut, Bytes};
use kestrel_common::{KestrelError, Result, RowPos, StoreConfig, TableId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a table's rows are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Rows live only in memory; positions are synthetic.
    Memory,
    /// Rows live in a data file and pass through the row cache.
    Cached,
}

/// Persistence boundary for encoded row records, addressed by position.
///
/// Positions are allocated once and stable for the row's lifetime; a
/// record is rewritten in place (its size never grows after allocation).
pub trait RowStore: Send + Sync {
    /// Reads the record at `pos`. `RowNotFound` if the position was never
    /// allocated or has been removed.
    fn read_row(&self, pos: RowPos) -> Result<Bytes>;

    /// Writes the record at `pos`. The payload must fit the allocation.
    fn write_row(&self, pos: RowPos, data: &[u8]) -> Result<()>;

    /// Reserves space for a record of `size` bytes and returns its position.
    fn allocate(&self, size: usize) -> Result<RowPos>;

    /// Removes the record at `pos`. Removing an absent record is a no-op.
    fn remove(&self, pos: RowPos) -> Result<()>;

    /// Flushes buffered writes to the backing medium.
    fn sync(&self) -> Result<()>;
}

/// Record header: allocated payload length in the low 31 bits; the high
/// bit marks a removed record.
const RECORD_HEADER_SIZE: u64 = 4;
const TOMBSTONE_BIT: u32 = 1 << 31;

/// File-backed row store, one data file per table.
///
/// Record layout at each allocated position: `[len: u32][payload]`.
/// Allocation appends; removal flags the header in place, leaving a hole
/// (space reclamation belongs to the external maintenance layer).
pub struct FileRowStore {
    path: PathBuf,
    fsync_enabled: bool,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    /// End-of-file offset where the next allocation lands.
    end: u64,
    /// Allocated payload capacity per position, for write bounds checks.
    allocations: HashMap<u64, u32>,
}

impl FileRowStore {
    /// Opens or creates the data file for `table` under the config's
    /// data directory.
    pub fn open(config: &StoreConfig, table: TableId) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(format!("{:08}.dat", table.0));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let end = file.metadata()?.len();

        let mut store = Self {
            path,
            fsync_enabled: config.fsync_enabled,
            inner: Mutex::new(FileInner {
                file,
                end,
                allocations: HashMap::new(),
            }),
        };
        store.scan_allocations()?;
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Rebuilds the allocation map by walking the record headers of an
    /// existing file.
    fn scan_allocations(&mut self) -> Result<()> {
        let inner = self.inner.get_mut();
        let mut offset = 0u64;
        while offset + RECORD_HEADER_SIZE <= inner.end {
            inner.file.seek(SeekFrom::Start(offset))?;
            let mut header = [0u8; 4];
            inner.file.read_exact(&mut header)?;
            let raw = (&header[..]).get_u32_le();
            let len = raw & !TOMBSTONE_BIT;
            if len == 0 {
                // Torn allocation at the tail of the file.
                inner.end = offset;
                break;
            }
            if raw & TOMBSTONE_BIT == 0 {
                inner.allocations.insert(offset, len);
            }
            offset += RECORD_HEADER_SIZE + len as u64;
        }
        Ok(())
    }
}

impl RowStore for FileRowStore {
    fn read_row(&self, pos: RowPos) -> Result<Bytes> {
        let mut inner = self.inner.lock();

        if !inner.allocations.contains_key(&pos.0) {
            return Err(KestrelError::RowNotFound { pos: pos.0 });
        }

        inner.file.seek(SeekFrom::Start(pos.0))?;
        let mut header = [0u8; 4];
        inner.file.read_exact(&mut header)?;
        let raw = (&header[..]).get_u32_le();
        let len = raw & !TOMBSTONE_BIT;
        if len == 0 || raw & TOMBSTONE_BIT != 0 {
            return Err(KestrelError::RowNotFound { pos: pos.0 });
        }

        let mut payload = vec![0u8; len as usize];
        inner.file.read_exact(&mut payload)?;
        Ok(Bytes::from(payload))
    }

    fn write_row(&self, pos: RowPos, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        let capacity = *inner
            .allocations
            .get(&pos.0)
            .ok_or(KestrelError::RowNotFound { pos: pos.0 })?;
        if data.len() > capacity as usize {
            return Err(KestrelError::Codec(format!(
                "record of {} bytes exceeds allocation of {} at {}",
                data.len(),
                capacity,
                pos
            )));
        }

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + data.len());
        buf.put_u32_le(capacity);
        buf.put_slice(data);

        inner.file.seek(SeekFrom::Start(pos.0))?;
        inner.file.write_all(&buf)?;
        if self.fsync_enabled {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<RowPos> {
        if size == 0 || size >= TOMBSTONE_BIT as usize {
            return Err(KestrelError::InvalidParameter {
                name: "record size".to_string(),
                value: size.to_string(),
            });
        }

        let mut inner = self.inner.lock();
        let pos = inner.end;

        // Write the header immediately so a scan can walk over the
        // reservation even before the first record write.
        let mut header = [0u8; 4];
        (&mut header[..]).put_u32_le(size as u32);
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.write_all(&header)?;

        inner.end = pos + RECORD_HEADER_SIZE + size as u64;
        inner.allocations.insert(pos, size as u32);
        Ok(RowPos(pos))
    }

    fn remove(&self, pos: RowPos) -> Result<()> {
        let mut inner = self.inner.lock();
        let capacity = match inner.allocations.remove(&pos.0) {
            Some(capacity) => capacity,
            None => return Ok(()),
        };

        let mut header = [0u8; 4];
        (&mut header[..]).put_u32_le(capacity | TOMBSTONE_BIT);
        inner.file.seek(SeekFrom::Start(pos.0))?;
        inner.file.write_all(&header)?;
        if self.fsync_enabled {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }
}

/// In-memory row store with synthetic positions, for `StorageMode::Memory`
/// tables and tests.
pub struct MemRowStore {
    next_pos: AtomicU64,
    rows: Mutex<HashMap<RowPos, Bytes>>,
}

impl MemRowStore {
    pub fn new() -> Self {
        Self {
            next_pos: AtomicU64::new(0),
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl Default for MemRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore for MemRowStore {
    fn read_row(&self, pos: RowPos) -> Result<Bytes> {
        match self.rows.lock().get(&pos) {
            Some(bytes) if !bytes.is_empty() => Ok(bytes.clone()),
            _ => Err(KestrelError::RowNotFound { pos: pos.0 }),
        }
    }

    fn write_row(&self, pos: RowPos, data: &[u8]) -> Result<()> {
        self.rows
            .lock()
            .insert(pos, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn allocate(&self, _size: usize) -> Result<RowPos> {
        let pos = RowPos(self.next_pos.fetch_add(1, Ordering::Relaxed));
        // Reserve the position with an empty record so reads before the
        // first write fail as not-found rather than panicking.
        self.rows.lock().insert(pos, Bytes::new());
        Ok(pos)
    }

    fn remove(&self, pos: RowPos) -> Result<()> {
        self.rows.lock().remove(&pos);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store(dir: &TempDir) -> FileRowStore {
        let config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        FileRowStore::open(&config, TableId(1)).unwrap()
    }

    #[test]
    fn test_file_store_write_read() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let pos = store.allocate(5).unwrap();
        store.write_row(pos, b"hello").unwrap();

        assert_eq!(store.read_row(pos).unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_file_store_positions_advance() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let a = store.allocate(10).unwrap();
        let b = store.allocate(10).unwrap();
        assert_eq!(b.0, a.0 + 4 + 10);
    }

    #[test]
    fn test_file_store_read_unallocated() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let err = store.read_row(RowPos(999)).unwrap_err();
        assert!(matches!(err, KestrelError::RowNotFound { pos: 999 }));
    }

    #[test]
    fn test_file_store_write_oversized_rejected() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let pos = store.allocate(4).unwrap();
        let err = store.write_row(pos, b"too big").unwrap_err();
        assert!(matches!(err, KestrelError::Codec(_)));
    }

    #[test]
    fn test_file_store_shorter_rewrite_keeps_allocation() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let pos = store.allocate(8).unwrap();
        store.write_row(pos, b"12345678").unwrap();
        store.write_row(pos, b"abc").unwrap();

        // The header keeps the allocated length; the payload prefix is
        // what changed. Reads return the full allocation.
        let read = store.read_row(pos).unwrap();
        assert_eq!(&read[..3], b"abc");
        assert_eq!(read.len(), 8);
    }

    #[test]
    fn test_file_store_remove_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let pos = store.allocate(5).unwrap();
        store.write_row(pos, b"hello").unwrap();
        store.remove(pos).unwrap();

        assert!(matches!(
            store.read_row(pos).unwrap_err(),
            KestrelError::RowNotFound { .. }
        ));
        // Removing again is a no-op.
        store.remove(pos).unwrap();
    }

    #[test]
    fn test_file_store_reopen_recovers_allocations() {
        let dir = TempDir::new().unwrap();
        let (a, b);
        {
            let store = file_store(&dir);
            a = store.allocate(5).unwrap();
            b = store.allocate(3).unwrap();
            store.write_row(a, b"alpha").unwrap();
            store.write_row(b, b"bee").unwrap();
            store.sync().unwrap();
        }

        let store = file_store(&dir);
        assert_eq!(&store.read_row(a).unwrap()[..], b"alpha");
        assert_eq!(&store.read_row(b).unwrap()[..], b"bee");

        // New allocations land past the recovered records.
        let c = store.allocate(2).unwrap();
        assert!(c.0 >= b.0 + 4 + 3);
    }

    #[test]
    fn test_file_store_reopen_skips_tombstones() {
        let dir = TempDir::new().unwrap();
        let (a, b, c);
        {
            let store = file_store(&dir);
            a = store.allocate(3).unwrap();
            b = store.allocate(3).unwrap();
            c = store.allocate(3).unwrap();
            store.write_row(a, b"aaa").unwrap();
            store.write_row(b, b"bbb").unwrap();
            store.write_row(c, b"ccc").unwrap();
            store.remove(b).unwrap();
        }

        let store = file_store(&dir);
        assert_eq!(&store.read_row(a).unwrap()[..], b"aaa");
        assert!(store.read_row(b).is_err());
        // The scan walks over the hole and finds the record behind it.
        assert_eq!(&store.read_row(c).unwrap()[..], b"ccc");
    }

    #[test]
    fn test_mem_store_roundtrip() {
        let store = MemRowStore::new();

        let a = store.allocate(0).unwrap();
        let b = store.allocate(0).unwrap();
        assert_ne!(a, b);

        store.write_row(a, b"one").unwrap();
        assert_eq!(store.read_row(a).unwrap().as_ref(), b"one");

        store.remove(a).unwrap();
        assert!(store.read_row(a).is_err());
        assert_eq!(store.len(), 1);
    }
}

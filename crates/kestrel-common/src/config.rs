//! Configuration structures for the KestrelDB engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the row cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of resident rows.
    pub max_rows: usize,
    /// Maximum total storage size of resident rows in bytes.
    pub max_bytes: usize,
    /// Access-count batching window. A cache hit only refreshes an entry's
    /// access snapshot when the global access clock has advanced by at
    /// least this much since the last refresh, so eviction order is
    /// approximately (not strictly) least-recently-accessed.
    pub access_batch: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_rows: 4096,
            max_bytes: 16 * 1024 * 1024, // 16 MB
            access_batch: 64,
        }
    }
}

impl CacheConfig {
    /// A small configuration convenient for tests: tight row capacity,
    /// effectively unbounded bytes, no access batching.
    pub fn with_capacity(max_rows: usize) -> Self {
        Self {
            max_rows,
            max_bytes: usize::MAX,
            access_batch: 1,
        }
    }
}

/// Configuration for the row store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

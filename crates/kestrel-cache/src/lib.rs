//! Bounded row cache for disk-backed tables.
//!
//! Rows are keyed by their file position and evicted with an
//! approximate-LRU policy driven by batched access counts. Dirty rows
//! are written back through a [`RowWriter`] in position-sorted batches;
//! pinned rows are never evicted.

mod cache;

pub use cache::{CacheStats, RowCache, RowWriter};

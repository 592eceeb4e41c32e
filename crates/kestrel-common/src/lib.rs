//! KestrelDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all KestrelDB
//! components: typed column values and comparators, the row representation
//! with its cache state and per-index node links, shared transaction types,
//! error taxonomy, and engine configuration.

pub mod action;
pub mod config;
pub mod error;
pub mod row;
pub mod value;

pub use action::{ActionKind, RowAction, Scn, ScnClock, SessionId};
pub use config::{CacheConfig, StoreConfig};
pub use error::{KestrelError, Result};
pub use row::{CacheState, IndexId, NodeLinks, Row, RowPos, TableId, NODE_RECORD_SIZE};
pub use value::{ColumnSpec, NullOrdering, RowComparator, SortDirection, Value};

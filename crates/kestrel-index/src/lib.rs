//! Row storage boundary and disk-backed AVL indexing.
//!
//! Rows live in a [`store::RowStore`] as length-prefixed records and pass
//! through the row cache on their way into memory. Indexes are AVL trees
//! whose nodes are the rows themselves: per-index link records hold
//! positions, never references, so any node can be evicted and
//! re-materialized independently.

pub mod avl;
pub mod codec;
pub mod resolver;
pub mod store;
pub mod table;

pub use avl::{AvlIndex, IndexCursor};
pub use codec::RowCodec;
pub use resolver::{PinGuard, RowResolver, StoreWriter};
pub use store::{FileRowStore, MemRowStore, RowStore, StorageMode};
pub use table::{IndexSpec, TableHandle};

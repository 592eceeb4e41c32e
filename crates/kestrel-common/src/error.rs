//! Error types for KestrelDB.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in KestrelDB engine operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Row not found at position {pos}")]
    RowNotFound { pos: u64 },

    #[error("Row at position {pos} is not memory-resident")]
    RowNotResident { pos: u64 },

    #[error("Row codec error: {0}")]
    Codec(String),

    // Index errors. Structural corruption is fatal: a node link that does
    // not resolve to a row of the expected index means the tree is no
    // longer trustworthy and the operation must not continue.
    #[error("Index structure corrupted at position {pos}: {reason}")]
    StructuralCorruption { pos: u64, reason: String },

    #[error("Duplicate key in unique index")]
    DuplicateKey,

    // Transaction errors
    #[error("Deadlock detected, session {session} chosen as victim")]
    Deadlock { session: u64 },

    #[error("Lock wait aborted for session {session}")]
    LockWaitAbort { session: u64 },

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Commit failed: {0}")]
    CommitFailure(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Returns true if this error is fatal to the engine rather than to a
    /// single statement. Fatal errors indicate a state the external
    /// recovery subsystem must address.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KestrelError::StructuralCorruption { .. } | KestrelError::CommitFailure(_)
        )
    }
}

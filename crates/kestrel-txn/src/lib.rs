//! Two-phase-locking transaction layer: sessions, table locks with
//! deadlock detection, and the transaction manager that drives row
//! actions through commit and rollback.

pub mod locks;
pub mod manager;
pub mod session;

pub use locks::{LockMode, LockTable, SessionControl, WaitForGraph};
pub use manager::TransactionManager;
pub use session::{Session, SessionRegistry};

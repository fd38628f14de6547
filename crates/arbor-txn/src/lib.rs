//! Transactions and locking for Arbor.
//!
//! This crate provides:
//! - A lock manager with counted grants, no-wait requests, timeouts and
//!   waits-for deadlock detection
//! - User transactions with undo-based rollback
//! - Internal transactions that commit structural changes independently
//! - A FIFO queue of work deferred until after commit

pub mod lock;
pub mod transaction;

pub use lock::{LockKey, LockManager, LockMode, LockOwner, LockWait};
pub use transaction::{
    PostCommitOutcome, PostCommitWork, SavePosition, Transaction, TransactionManager, TxnId,
};

//! B-link tree secondary indexes for Arbor.
//!
//! This crate provides:
//! - Index creation, reopen and checkpoint over a page container
//! - Inserts with top-down splits and bulk load of sorted rows
//! - Forward scans with start/stop bounds, qualifiers and held cursors
//! - Row, previous-key and scan locking under several isolation policies
//! - Reclamation of committed deletes and removal of empty pages
//! - Cost estimates and a maximum-row fetch for the optimizer

mod btree;

pub use btree::{
    BTree, BTreeController, BTreeCostController, BTreePostCommit, BTreeScan, CompareOp,
    CreateIndex, IndexColumn, InsertResult, LockingPolicy, Qualifier, ScanCost, ScanKind,
    ScanParams, ScanState, ScanStats, SearchOp,
};

//! B-link tree index access method.
//!
//! Every page of an index container holds a control row in slot 0 and
//! index rows in slots 1..N. Leaves hold the indexed rows, each ending in
//! the location of its base-table row. Branches hold one row per child
//! after the first: the first key of the child followed by its page
//! number. The first child of a branch is kept in its control row.
//!
//! ```text
//!                         page 1 (root, level 2)
//!                      [ctl left=2 | k40 -> 3]
//!                        /                 \
//!        page 2 (level 1)                   page 3 (level 1)
//!   [ctl left=4 | k20 -> 5]     <-->    [ctl left=6 | k60 -> 7]
//!       /            \                       /            \
//!  page 4  <-->  page 5    <-->     page 6  <-->  page 7
//!  [ctl|k1..k19] [ctl|k20..]        [ctl|k40..]   [ctl|k60..]
//! ```
//!
//! Pages on one level are doubly linked left to right. The root never
//! moves from page 1: the tree grows and shrinks at the root by rewriting
//! its control row.
//!
//! ## Concurrency
//!
//! Pages are protected by exclusive latches, taken top-down and left to
//! right; a left sibling is only ever latched NOWAIT. Row, previous-key
//! and scan locks come from the transaction's lock manager and are never
//! waited for while a latch is held (see [`locking`]).
//!
//! Structure changes run in internal transactions that commit one tree
//! level at a time, independently of the user transaction that triggered
//! them. A user abort therefore never undoes a split.
//!
//! ## Reclamation
//!
//! Deleting a row only marks it. Marked rows are purged when an insert
//! needs room on their page, or after commit by [`BTreePostCommit`] once a
//! page's last row was deleted; an emptied leaf is then unlinked from the
//! tree.

mod conglomerate;
mod constants;
mod control_row;
mod controller;
mod cost;
mod locking;
mod max_scan;
mod open;
mod post_commit;
mod qualifier;
mod row_position;
mod scan;
mod search;
mod shrink;
mod split;

pub use conglomerate::{BTree, CreateIndex, IndexColumn};
pub use controller::{BTreeController, InsertResult};
pub use cost::{BTreeCostController, ScanCost, ScanKind};
pub use locking::LockingPolicy;
pub use post_commit::BTreePostCommit;
pub use qualifier::{CompareOp, Qualifier};
pub use scan::{BTreeScan, ScanParams, ScanState, ScanStats, SearchOp};

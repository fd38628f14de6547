//! Reclaiming a leaf after the transaction that emptied it commits.
//!
//! The work runs in its own transaction. With an exclusive table lock it
//! may purge every delete mark on the leaf, since no other transaction can
//! have a delete in flight, and then remove the leaf from the tree. When
//! the table lock is not available it falls back to purging the rows it
//! can lock one at a time, leaving the page in place.

use std::sync::Arc;

use tracing::{debug, warn};

use arbor_common::{ArborError, IndexConfig, Result};
use arbor_txn::{PostCommitOutcome, PostCommitWork, Transaction, TransactionManager};

use super::conglomerate::BTree;
use super::control_row::ControlRow;
use super::locking::LockingPolicy;
use super::open::OpenBTree;
use super::shrink::{purge_committed_deletes, purge_row_level_committed_deletes, shrink_for};

/// Queued when a delete leaves a non-root leaf without live rows.
pub struct BTreePostCommit {
    btree: Arc<BTree>,
    page_num: u32,
}

impl BTreePostCommit {
    pub fn new(btree: Arc<BTree>, page_num: u32) -> Self {
        Self { btree, page_num }
    }

    fn reclaim(&self, txn: &Arc<Transaction>) -> Result<()> {
        let config = IndexConfig::default();
        let table = OpenBTree::try_open(
            Arc::clone(&self.btree),
            Arc::clone(txn),
            LockingPolicy::Table,
            &config,
            true,
        )?;
        if let Some(open) = table {
            if let Some(key) = purge_committed_deletes(&open, self.page_num)? {
                shrink_for(&open, open.root()?, &key)?;
            }
            return Ok(());
        }

        // Another transaction has the table open; purge what can be locked
        let Some(open) = OpenBTree::try_open(
            Arc::clone(&self.btree),
            Arc::clone(txn),
            LockingPolicy::RowSerializable,
            &config,
            true,
        )?
        else {
            return Err(ArborError::LockTimeout {
                resource: format!("table {}", self.btree.base_container_id()),
            });
        };
        let mut leaf = match ControlRow::get(&open, self.page_num) {
            Ok(leaf) => leaf,
            Err(ArborError::PageNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if leaf.is_leaf() {
            purge_row_level_committed_deletes(&open, &mut leaf)?;
        }
        Ok(())
    }
}

impl PostCommitWork for BTreePostCommit {
    fn describe(&self) -> String {
        format!(
            "reclaim page {} of index {} ({})",
            self.page_num,
            self.btree.name(),
            self.btree.container_id()
        )
    }

    fn perform(&mut self, manager: &Arc<TransactionManager>) -> Result<PostCommitOutcome> {
        let txn = manager.begin();
        match self.reclaim(&txn) {
            Ok(()) => {
                txn.commit()?;
                debug!(index = %self.btree.name(), page = self.page_num, "leaf reclaimed");
                Ok(PostCommitOutcome::Done)
            }
            Err(e) if e.is_lock_error() => {
                txn.abort()?;
                Ok(PostCommitOutcome::Requeue)
            }
            Err(e) => {
                txn.abort()?;
                warn!(index = %self.btree.name(), page = self.page_num, error = %e, "leaf reclaim failed");
                Ok(PostCommitOutcome::Done)
            }
        }
    }
}

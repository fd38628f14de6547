//! Per-open session state shared by every B-tree operation.

use std::sync::Arc;

use arbor_buffer::Container;
use arbor_common::{IndexConfig, Result, FIRST_PAGE_NUM};
use arbor_txn::{LockWait, Transaction};
use arbor_wal::UndoLog;

use super::conglomerate::BTree;
use super::control_row::ControlRow;
use super::locking::LockingPolicy;

/// An index opened by one transaction.
///
/// Holds the container handle, the transaction every page change is logged
/// to and every lock is taken for, and the locking policy of the open. An
/// `OpenBTree` is driven by one thread at a time.
pub(crate) struct OpenBTree {
    btree: Arc<BTree>,
    container: Arc<Container>,
    txn: Arc<Transaction>,
    policy: LockingPolicy,
    config: IndexConfig,
    for_update: bool,
}

impl OpenBTree {
    /// Opens the index and takes the table lock the policy calls for,
    /// waiting if needed.
    pub fn open(
        btree: Arc<BTree>,
        txn: Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        for_update: bool,
    ) -> Result<Self> {
        let open = Self::unlocked(btree, txn, policy, config, for_update)?;
        open.lock_table(LockWait::Wait)?;
        Ok(open)
    }

    /// Opens the index without waiting for the table lock. `None` means the
    /// lock was not available.
    pub fn try_open(
        btree: Arc<BTree>,
        txn: Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        for_update: bool,
    ) -> Result<Option<Self>> {
        let open = Self::unlocked(btree, txn, policy, config, for_update)?;
        if open.lock_table(LockWait::NoWait)? {
            Ok(Some(open))
        } else {
            Ok(None)
        }
    }

    /// Opens the index for reading without any locks.
    pub fn open_unlocked(btree: Arc<BTree>, txn: Arc<Transaction>, config: &IndexConfig) -> Result<Self> {
        Self::unlocked(btree, txn, LockingPolicy::ReadUncommitted, config, false)
    }

    fn unlocked(
        btree: Arc<BTree>,
        txn: Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        for_update: bool,
    ) -> Result<Self> {
        let container = txn.manager().container(btree.container_id())?;
        Ok(Self {
            btree,
            container,
            txn,
            policy,
            config: config.clone(),
            for_update,
        })
    }

    /// Opens the same index for an internal transaction. The table lock is
    /// left to the caller.
    pub fn for_internal(&self, txn: Arc<Transaction>, policy: LockingPolicy) -> OpenBTree {
        OpenBTree {
            btree: Arc::clone(&self.btree),
            container: Arc::clone(&self.container),
            txn,
            policy,
            config: self.config.clone(),
            for_update: true,
        }
    }

    #[inline]
    pub fn conglomerate(&self) -> &Arc<BTree> {
        &self.btree
    }

    #[inline]
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    #[inline]
    pub fn txn(&self) -> &Arc<Transaction> {
        &self.txn
    }

    #[inline]
    pub fn log(&self) -> &UndoLog {
        self.txn.log()
    }

    #[inline]
    pub fn policy(&self) -> LockingPolicy {
        self.policy
    }

    #[inline]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[inline]
    pub fn for_update(&self) -> bool {
        self.for_update
    }

    /// Row limit per page, not counting the control row.
    #[inline]
    pub fn max_rows_per_page(&self) -> usize {
        self.config.rows_per_page_limit()
    }

    /// Latches the root page.
    pub fn root(&self) -> Result<ControlRow> {
        ControlRow::get(self, FIRST_PAGE_NUM)
    }
}

impl std::fmt::Debug for OpenBTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenBTree")
            .field("index", &self.btree.name())
            .field("container", &self.container.id())
            .field("txn", &self.txn.id())
            .field("policy", &self.policy)
            .field("for_update", &self.for_update)
            .finish()
    }
}

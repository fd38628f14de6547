//! Lock protocol of the index.
//!
//! Page latches are never held while waiting for a lock. Every lock request
//! made under a latch is NOWAIT; when it cannot be granted the request
//! comes back as a [`Blocked`] value, the caller drops its latches, calls
//! [`OpenBTree::wait_for`] and starts its search again from the root.
//!
//! Three kinds of locks are taken:
//!
//! - Row locks on base-table row locations, the last column of every
//!   index row.
//! - Previous-key locks on the row before an insert or scan start point,
//!   or on the previous-to-first key of the index when there is no such
//!   row. They protect the gap against phantoms.
//! - Scan locks on leaf page numbers. Scans hold them in shared mode while
//!   positioned on a leaf; splits and space reclamation need them in
//!   exclusive mode, so rows never move under a scan of another
//!   transaction.

use tracing::trace;

use arbor_buffer::PageLatch;
use arbor_common::{ArborError, Result, RowLocation, Value, INVALID_PAGE_NUM};
use arbor_txn::{LockKey, LockMode, LockWait};

use super::constants::FIRST_ROW_SLOT;
use super::control_row::ControlRow;
use super::open::OpenBTree;

/// How an open index locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockingPolicy {
    /// No locks at all.
    ReadUncommitted,
    /// One table lock at open, shared or exclusive; row and scan locks are
    /// granted without asking.
    Table,
    /// Intent table lock at open, row locks held to commit and previous-key
    /// locks on scans and inserts.
    #[default]
    RowSerializable,
    /// Like `RowSerializable`, but scans release each row lock after the
    /// row is read and take no previous-key locks.
    RowReadCommitted,
}

impl LockingPolicy {
    /// True if row and scan locks are requested from the lock manager.
    #[inline]
    pub fn locks_rows(self) -> bool {
        matches!(self, LockingPolicy::RowSerializable | LockingPolicy::RowReadCommitted)
    }

    /// True if scans lock the key before their start position.
    #[inline]
    pub fn locks_previous_key_on_scan(self) -> bool {
        self == LockingPolicy::RowSerializable
    }
}

/// A lock or latch request that would have had to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Blocked {
    /// The lock was not granted NOWAIT. `instant` locks are released again
    /// as soon as the wait grants them.
    Lock {
        key: LockKey,
        mode: LockMode,
        instant: bool,
    },
    /// A left sibling could not be latched NOWAIT.
    Latch { page_num: u32 },
}

/// Reads the base row location from the last column of the row at `slot`.
pub(crate) fn row_location_at(open: &OpenBTree, page: &PageLatch, slot: usize) -> Result<RowLocation> {
    let column = open.conglomerate().row_location_column();
    let value = page.fetch_field_from_slot(slot, column)?;
    value.as_row_location().ok_or_else(|| ArborError::BTreeCorrupted {
        container_id: page.container().id(),
        page_num: page.page_num(),
        reason: format!("slot {} carries no row location", slot),
    })
}

impl OpenBTree {
    fn table_key(&self) -> LockKey {
        LockKey::Table {
            container_id: self.conglomerate().base_container_id(),
        }
    }

    fn row_key(&self, location: RowLocation) -> LockKey {
        LockKey::Row {
            container_id: self.conglomerate().base_container_id(),
            location,
        }
    }

    fn scan_key(&self, page_num: u32) -> LockKey {
        LockKey::Scan {
            container_id: self.container().id(),
            page_num,
        }
    }

    fn previous_to_first_key(&self) -> LockKey {
        LockKey::PreviousToFirstKey {
            container_id: self.conglomerate().base_container_id(),
        }
    }

    fn lock_no_wait(&self, key: LockKey, mode: LockMode, instant: bool) -> Result<Option<Blocked>> {
        if self.txn().lock(key, mode, LockWait::NoWait)? {
            if instant {
                self.txn().unlock(key, mode);
            }
            return Ok(None);
        }
        trace!(txn = %self.txn().id(), resource = %key, ?mode, "lock not granted without waiting");
        Ok(Some(Blocked::Lock { key, mode, instant }))
    }

    /// Takes the table lock of the policy. Returns false if `wait` is
    /// `NoWait` and the lock is not available.
    pub(crate) fn lock_table(&self, wait: LockWait) -> Result<bool> {
        let mode = match (self.policy(), self.for_update()) {
            (LockingPolicy::ReadUncommitted, _) => return Ok(true),
            (LockingPolicy::Table, false) => LockMode::Shared,
            (LockingPolicy::Table, true) => LockMode::Exclusive,
            (_, false) => LockMode::IntentShared,
            (_, true) => LockMode::IntentExclusive,
        };
        self.txn().lock(self.table_key(), mode, wait)
    }

    /// Waits for what blocked a request. The caller must hold no latches.
    pub(crate) fn wait_for(&self, blocked: Blocked) -> Result<()> {
        match blocked {
            Blocked::Lock { key, mode, instant } => {
                self.txn().lock(key, mode, LockWait::Wait)?;
                if instant {
                    self.txn().unlock(key, mode);
                }
            }
            Blocked::Latch { page_num } => {
                // Latch and release, only to wait out the holder
                drop(self.container().get_page(page_num));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Scan locks
    // ========================================================================

    /// Locks a leaf against moving rows (`for_update`) or for a scan
    /// positioned on it. Exclusive scan locks are taken under every policy
    /// since they protect scans of other transactions.
    pub(crate) fn lock_scan(&self, page_num: u32, for_update: bool) -> Result<Option<Blocked>> {
        if !for_update && !self.policy().locks_rows() {
            return Ok(None);
        }
        let mode = if for_update {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let key = self.scan_key(page_num);
        if self.txn().lock(key, mode, LockWait::NoWait)? {
            return Ok(None);
        }
        trace!(txn = %self.txn().id(), page = page_num, ?mode, "scan lock not granted without waiting");
        // A scan locks its page again once it has repositioned
        Ok(Some(Blocked::Lock {
            key,
            mode,
            instant: !for_update,
        }))
    }

    /// Releases a shared scan lock taken by [`lock_scan`](Self::lock_scan).
    pub(crate) fn unlock_scan(&self, page_num: u32) {
        if self.policy().locks_rows() {
            self.txn().unlock(self.scan_key(page_num), LockMode::Shared);
        }
    }

    /// Exclusive scan lock for purging rows, NOWAIT.
    pub(crate) fn lock_scan_for_reclaim(&self, page_num: u32) -> Result<bool> {
        self.txn()
            .lock(self.scan_key(page_num), LockMode::Exclusive, LockWait::NoWait)
    }

    // ========================================================================
    // Row locks
    // ========================================================================

    /// Tries to lock a delete-marked row exclusively without waiting. A
    /// grant proves the deleting transaction has committed.
    pub(crate) fn lock_committed_deleted_row(&self, leaf: &ControlRow, slot: usize) -> Result<bool> {
        if !self.policy().locks_rows() {
            return Ok(true);
        }
        let location = row_location_at(self, leaf.page(), slot)?;
        self.txn()
            .lock(self.row_key(location), LockMode::Exclusive, LockWait::NoWait)
    }

    /// Locks the base row of a row about to be inserted, waiting if needed.
    /// The caller must hold no latches.
    pub(crate) fn lock_inserted_row(&self, row: &[Value]) -> Result<()> {
        if !self.policy().locks_rows() {
            return Ok(());
        }
        let column = self.conglomerate().row_location_column();
        let location = row
            .get(column)
            .and_then(Value::as_row_location)
            .ok_or_else(|| ArborError::InvalidParameter {
                name: "row".to_string(),
                value: format!("column {} is not a row location", column),
            })?;
        self.txn()
            .lock(self.row_key(location), LockMode::Exclusive, LockWait::Wait)?;
        Ok(())
    }

    /// Locks the row at `slot` exclusively, for an insert that matches it.
    pub(crate) fn lock_existing_row(&self, leaf: &ControlRow, slot: usize) -> Result<Option<Blocked>> {
        if !self.policy().locks_rows() {
            return Ok(None);
        }
        let location = row_location_at(self, leaf.page(), slot)?;
        self.lock_no_wait(self.row_key(location), LockMode::Exclusive, false)
    }

    /// Locks the row a scan is about to return.
    pub(crate) fn lock_scan_row(
        &self,
        leaf: &ControlRow,
        slot: usize,
        for_update: bool,
    ) -> Result<Option<Blocked>> {
        if !self.policy().locks_rows() {
            return Ok(None);
        }
        let location = row_location_at(self, leaf.page(), slot)?;
        let mode = if for_update {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        self.lock_no_wait(self.row_key(location), mode, false)
    }

    /// Releases a read lock once the row has been returned, for policies
    /// that do not repeat reads.
    pub(crate) fn unlock_scan_row_after_read(&self, location: RowLocation, for_update: bool) {
        if self.policy() == LockingPolicy::RowReadCommitted && !for_update {
            self.txn().unlock(self.row_key(location), LockMode::Shared);
        }
    }

    /// Locks the row before `slot` on the leaf, or the last row of the
    /// nearest non-empty left sibling, or the previous-to-first key.
    pub(crate) fn lock_previous_row(
        &self,
        leaf: &ControlRow,
        slot: usize,
        mode: LockMode,
        instant: bool,
    ) -> Result<Option<Blocked>> {
        if !self.policy().locks_rows() {
            return Ok(None);
        }
        if slot > FIRST_ROW_SLOT {
            let location = row_location_at(self, leaf.page(), slot - 1)?;
            return self.lock_no_wait(self.row_key(location), mode, instant);
        }
        self.search_left_and_lock_previous_key(leaf, mode, instant)
    }

    /// Walks left from the leaf, latching each sibling NOWAIT while the
    /// previous one is still held, to the first page with a row.
    fn search_left_and_lock_previous_key(
        &self,
        leaf: &ControlRow,
        mode: LockMode,
        instant: bool,
    ) -> Result<Option<Blocked>> {
        let mut left_page = leaf.left_sibling();
        let mut _held: Option<ControlRow> = None;
        loop {
            if left_page == INVALID_PAGE_NUM {
                return self.lock_no_wait(self.previous_to_first_key(), mode, instant);
            }
            let Some(left) = ControlRow::get_no_wait(self, left_page)? else {
                return Ok(Some(Blocked::Latch { page_num: left_page }));
            };
            if left.row_count() > 0 {
                let location = row_location_at(self, left.page(), left.record_count() - 1)?;
                return self.lock_no_wait(self.row_key(location), mode, instant);
            }
            left_page = left.left_sibling();
            _held = Some(left);
        }
    }
}

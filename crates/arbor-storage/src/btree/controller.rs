//! Insert path and bulk load.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use arbor_common::{ArborError, Result, Row, RowLocation, Value, INVALID_PAGE_NUM};
use arbor_txn::{LockMode, LockWait, Transaction};

use super::conglomerate::BTree;
use super::constants::{
    FIRST_ROW_SLOT, SPLIT_FLAG_FIRST_IN_TABLE, SPLIT_FLAG_FIRST_ON_PAGE, SPLIT_FLAG_LAST_IN_TABLE,
    SPLIT_FLAG_LAST_ON_PAGE,
};
use super::control_row::{page_value, ControlRow};
use super::locking::LockingPolicy;
use super::open::OpenBTree;
use super::search::{PartialKeyOrder, SearchParameters};
use super::shrink::purge_row_level_committed_deletes;
use super::split::split_for;

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// A live row with the same unique columns already exists.
    Duplicate,
}

/// Inserts rows into an index opened for update.
#[derive(Debug)]
pub struct BTreeController {
    open: OpenBTree,
}

impl BTreeController {
    pub(crate) fn new(open: OpenBTree) -> Self {
        Self { open }
    }

    /// Returns the index this controller writes.
    pub fn conglomerate(&self) -> &Arc<BTree> {
        self.open.conglomerate()
    }

    /// Rows are located by key, not by row location.
    pub fn is_keyed(&self) -> bool {
        true
    }

    /// Inserts a row.
    ///
    /// A delete-marked row with the same unique columns is brought back
    /// instead of inserting a second copy. For a unique index the revived
    /// row takes the row location of the new row.
    pub fn insert(&mut self, row: &[Value]) -> Result<InsertResult> {
        let btree = Arc::clone(self.open.conglomerate());
        btree.validate_row(row)?;

        // Taken before any latch so the wait can block
        self.open.lock_inserted_row(row)?;

        let mut reclaim_attempted = false;
        loop {
            let mut sp = SearchParameters::new(row, PartialKeyOrder::Left, false);
            let mut leaf = self.open.root()?.search(&self.open, &mut sp)?;
            let insert_slot = if sp.result_exact {
                sp.result_slot
            } else {
                sp.result_slot + 1
            };

            // Protect the gap the row goes into
            if let Some(blocked) =
                self.open
                    .lock_previous_row(&leaf, insert_slot, LockMode::InsertPreviousKey, true)?
            {
                drop(leaf);
                self.open.wait_for(blocked)?;
                trace!(container = self.open.container().id(), "insert retrying after previous key wait");
                continue;
            }

            if sp.result_exact {
                if btree.is_unique() {
                    // Same unique columns, maybe another row location: wait
                    // behind whoever owns the existing row
                    if let Some(blocked) = self.open.lock_existing_row(&leaf, insert_slot)? {
                        drop(leaf);
                        self.open.wait_for(blocked)?;
                        continue;
                    }
                }

                if !leaf.page().is_deleted_at_slot(insert_slot)? {
                    return Ok(InsertResult::Duplicate);
                }

                let log = self.open.log();
                leaf.page_mut().delete_at_slot(log, insert_slot, false)?;
                if !btree.is_unique() {
                    return Ok(InsertResult::Inserted);
                }
                let column = btree.row_location_column();
                if leaf
                    .page_mut()
                    .update_field_at_slot(log, insert_slot, column, &row[column])?
                {
                    return Ok(InsertResult::Inserted);
                }
                // The new location does not fit; split instead
                leaf.page_mut().delete_at_slot(log, insert_slot, true)?;
            } else if leaf.row_count() < self.open.max_rows_per_page() {
                if leaf
                    .page_mut()
                    .insert_at_slot(self.open.log(), insert_slot, row, false)?
                    .is_some()
                {
                    return Ok(InsertResult::Inserted);
                }
                if leaf.record_count() <= FIRST_ROW_SLOT + 1 {
                    return Err(ArborError::NoSpaceForKey {
                        container_id: self.open.container().id(),
                        page_num: leaf.page_num(),
                    });
                }
            }

            let mut flag = 0;
            if insert_slot == FIRST_ROW_SLOT {
                flag |= SPLIT_FLAG_FIRST_ON_PAGE;
                if leaf.is_leftmost() {
                    flag |= SPLIT_FLAG_FIRST_IN_TABLE;
                }
            } else if insert_slot == leaf.record_count() {
                flag |= SPLIT_FLAG_LAST_ON_PAGE;
                if leaf.is_rightmost() {
                    flag |= SPLIT_FLAG_LAST_IN_TABLE;
                }
            }

            if leaf.page().non_deleted_record_count() == leaf.record_count() {
                // Nothing to reclaim
                reclaim_attempted = true;
            }

            let leaf_page = leaf.page_num();
            let branch_row = branch_row_for(row);
            // Splits latch top-down, so the leaf has to go first
            drop(leaf);
            self.start_xact_and_do_split(!reclaim_attempted, leaf_page, &branch_row, flag)?;

            // Reclaiming once is enough; rows that stayed deleted belong to
            // live transactions
            reclaim_attempted = true;
        }
    }

    /// Loads rows that arrive sorted and free of duplicates into an empty
    /// index, appending to the rightmost leaf and splitting off a new one
    /// whenever it fills up. Takes no locks and checks no duplicates.
    ///
    /// Returns the number of rows loaded.
    pub fn load<I>(&mut self, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Row>,
    {
        let btree = Arc::clone(self.open.conglomerate());
        let mut leaf = self.open.root()?;
        if !leaf.is_leaf() || leaf.row_count() > 0 {
            return Err(ArborError::InvalidParameter {
                name: "index".to_string(),
                value: format!("{} is not empty", btree.name()),
            });
        }

        let mut insert_slot = FIRST_ROW_SLOT;
        let mut loaded = 0u64;
        for row in rows {
            btree.validate_row(&row)?;
            loop {
                if self.load_insert(&mut leaf, insert_slot, &row)? {
                    break;
                }
                leaf = self.load_split(leaf, &row)?;
                insert_slot = leaf.record_count();
            }
            insert_slot += 1;
            loaded += 1;
        }
        drop(leaf);

        debug!(
            index = %btree.name(),
            container = self.open.container().id(),
            rows = loaded,
            "index loaded"
        );
        Ok(loaded)
    }

    fn load_insert(&self, leaf: &mut ControlRow, insert_slot: usize, row: &[Value]) -> Result<bool> {
        if leaf.row_count() >= self.open.max_rows_per_page() {
            return Ok(false);
        }
        if leaf
            .page_mut()
            .insert_at_slot(self.open.log(), insert_slot, row, false)?
            .is_some()
        {
            return Ok(true);
        }
        if leaf.record_count() <= FIRST_ROW_SLOT + 1 {
            return Err(ArborError::NoSpaceForKey {
                container_id: self.open.container().id(),
                page_num: leaf.page_num(),
            });
        }
        Ok(false)
    }

    /// Splits the last row of the rightmost leaf off into a new leaf and
    /// returns that leaf latched.
    fn load_split(&self, leaf: ControlRow, row: &[Value]) -> Result<ControlRow> {
        let leaf_page = leaf.page_num();
        drop(leaf);
        let new_leaf = self.start_xact_and_do_split(
            false,
            leaf_page,
            &branch_row_for(row),
            SPLIT_FLAG_LAST_ON_PAGE | SPLIT_FLAG_LAST_IN_TABLE,
        )?;
        ControlRow::get(&self.open, new_leaf)
    }

    /// Makes room for `branch_row` in an internal transaction: first by
    /// purging committed deletes from the leaf if `attempt_reclaim`, and
    /// if that frees nothing, by a split pass from the root.
    ///
    /// Returns the page number of the leaf the pass ended on.
    fn start_xact_and_do_split(
        &self,
        attempt_reclaim: bool,
        leaf_page: u32,
        branch_row: &[Value],
        flag: u32,
    ) -> Result<u32> {
        let split_txn = self.open.txn().start_internal_transaction()?;

        // Every latch is released by the time this returns
        let result = self.reclaim_or_split(&split_txn, attempt_reclaim, leaf_page, branch_row, flag);
        match result {
            Ok(page) => {
                split_txn.commit()?;
                if self.open.config().check_consistency {
                    self.open.root()?.check_consistency(&self.open, None)?;
                }
                Ok(page)
            }
            Err(e) => {
                if let Err(abort_err) = split_txn.abort() {
                    warn!(
                        txn = %split_txn.id(),
                        error = %abort_err,
                        "structure change rollback failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn reclaim_or_split(
        &self,
        split_txn: &Arc<Transaction>,
        attempt_reclaim: bool,
        leaf_page: u32,
        branch_row: &[Value],
        flag: u32,
    ) -> Result<u32> {
        if attempt_reclaim {
            // Row locks tell committed deletes apart from the deletes of
            // live transactions, so reclaiming always locks rows
            let reclaim_open = self
                .open
                .for_internal(Arc::clone(split_txn), LockingPolicy::RowSerializable);
            if reclaim_open.lock_table(LockWait::NoWait)?
                && reclaim_deleted_rows(&reclaim_open, leaf_page)?
            {
                return Ok(leaf_page);
            }
        }

        let split_open = self
            .open
            .for_internal(Arc::clone(split_txn), self.open.policy());
        let root = split_open.root()?;
        split_for(&split_open, root, None, branch_row, flag)
    }

    // ========================================================================
    // Operations keyed by row location
    // ========================================================================

    /// Not supported: index rows are located by key.
    pub fn delete(&mut self, _location: RowLocation) -> Result<bool> {
        Err(ArborError::UnimplementedFeature("delete by row location"))
    }

    /// Not supported: index rows are located by key.
    pub fn fetch(&self, _location: RowLocation) -> Result<Option<Row>> {
        Err(ArborError::UnimplementedFeature("fetch by row location"))
    }

    /// Not supported: index rows are located by key.
    pub fn replace(&mut self, _location: RowLocation, _row: &[Value]) -> Result<bool> {
        Err(ArborError::UnimplementedFeature("replace by row location"))
    }

    /// Not supported: rows are locked through the base table.
    pub fn lock_row(&mut self, _location: RowLocation, _for_update: bool) -> Result<bool> {
        Err(ArborError::UnimplementedFeature("lock row by row location"))
    }
}

/// The branch row a split pass targets: the row followed by a placeholder
/// child page.
fn branch_row_for(row: &[Value]) -> Row {
    let mut branch_row = Vec::with_capacity(row.len() + 1);
    branch_row.extend_from_slice(row);
    branch_row.push(page_value(INVALID_PAGE_NUM));
    branch_row
}

/// Purges committed deletes from a leaf under row locks. Returns true if
/// at least one row was purged.
fn reclaim_deleted_rows(open: &OpenBTree, page_num: u32) -> Result<bool> {
    let mut leaf = match ControlRow::get(open, page_num) {
        Ok(leaf) => leaf,
        Err(ArborError::PageNotFound { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    // The latch was given up since the leaf was searched; the page may
    // have been reused as a branch
    if !leaf.is_leaf() {
        return Ok(false);
    }
    Ok(purge_row_level_committed_deletes(open, &mut leaf)? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::test_support::{int_row, TestIndex};
    use arbor_common::{IndexConfig, TypeId};

    fn controller(index: &TestIndex, max_rows: Option<usize>) -> BTreeController {
        let config = IndexConfig {
            max_rows_per_page: max_rows,
            check_consistency: true,
        };
        index
            .btree
            .open_controller(&index.txn, LockingPolicy::RowSerializable, &config)
            .unwrap()
    }

    fn mark_deleted(index: &TestIndex, slot: usize) {
        let open = index.open_unlocked();
        let mut root = open.root().unwrap();
        root.page_mut().delete_at_slot(open.log(), slot, true).unwrap();
    }

    #[test]
    fn test_insert_and_duplicate() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, None);
        assert_eq!(cc.insert(&int_row(2)).unwrap(), InsertResult::Inserted);
        assert_eq!(cc.insert(&int_row(1)).unwrap(), InsertResult::Inserted);
        assert_eq!(cc.insert(&int_row(2)).unwrap(), InsertResult::Duplicate);
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap(), vec![2]);
    }

    #[test]
    fn test_insert_rejects_malformed_row() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, None);
        assert!(cc.insert(&[Value::Int64(1)]).is_err());
    }

    #[test]
    fn test_reinsert_of_deleted_row_undeletes() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, None);
        cc.insert(&int_row(7)).unwrap();
        mark_deleted(&index, 1);

        assert_eq!(cc.insert(&int_row(7)).unwrap(), InsertResult::Inserted);
        let open = index.open_unlocked();
        let root = open.root().unwrap();
        assert_eq!(root.row_count(), 1);
        assert!(!root.page().is_deleted_at_slot(1).unwrap());
    }

    #[test]
    fn test_unique_reinsert_takes_new_location() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]).unique());
        let mut cc = controller(&index, None);
        cc.insert(&int_row(5)).unwrap();
        mark_deleted(&index, 1);

        let moved = vec![Value::Int64(5), Value::RowLocation(RowLocation::new(1, 99))];
        assert_eq!(cc.insert(&moved).unwrap(), InsertResult::Inserted);
        let open = index.open_unlocked();
        let root = open.root().unwrap();
        assert_eq!(root.row_at(1).unwrap(), moved);
        drop(root);

        // Unique on the key alone
        let other = vec![Value::Int64(5), Value::RowLocation(RowLocation::new(1, 100))];
        assert_eq!(cc.insert(&other).unwrap(), InsertResult::Duplicate);
    }

    #[test]
    fn test_inserts_split_tree() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, Some(4));
        for k in (1..=60).rev() {
            assert_eq!(cc.insert(&int_row(k)).unwrap(), InsertResult::Inserted);
        }
        assert!(index.btree.height(&index.txn).unwrap() > 2);
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap()[0], 60);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_full_page_reclaims_before_splitting() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, Some(4));
        for k in 1..=4 {
            cc.insert(&int_row(k)).unwrap();
        }
        index.txn.commit_and_continue().unwrap();
        // Deletes whose row locks nobody holds count as committed
        mark_deleted(&index, 2);
        mark_deleted(&index, 3);

        cc.insert(&int_row(9)).unwrap();
        assert_eq!(index.btree.height(&index.txn).unwrap(), 1);
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap(), vec![3]);
    }

    #[test]
    fn test_load_requires_empty_index() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, None);
        cc.insert(&int_row(1)).unwrap();
        let err = cc.load(vec![int_row(2)]).unwrap_err();
        assert!(matches!(err, ArborError::InvalidParameter { .. }));
    }

    #[test]
    fn test_load_fills_rightmost_leaves() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, Some(8));
        let loaded = cc.load((1..=200).map(int_row)).unwrap();
        assert_eq!(loaded, 200);
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap()[0], 200);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_row_location_operations_unsupported() {
        let index = TestIndex::new(CreateIndex::new("c", 1, &[TypeId::Int64]));
        let mut cc = controller(&index, None);
        let loc = RowLocation::new(1, 1);
        assert!(cc.is_keyed());
        assert!(matches!(cc.delete(loc), Err(ArborError::UnimplementedFeature(_))));
        assert!(matches!(cc.fetch(loc), Err(ArborError::UnimplementedFeature(_))));
        assert!(matches!(
            cc.replace(loc, &int_row(1)),
            Err(ArborError::UnimplementedFeature(_))
        ));
        assert!(matches!(cc.lock_row(loc, true), Err(ArborError::UnimplementedFeature(_))));
    }
}

//! Space reclamation: purging committed deletes and removing empty pages.
//!
//! Shrinking runs top-down like a split. Starting at the root it follows
//! the key of the emptied leaf; a page whose child disappeared drops the
//! branch row pointing at it and may in turn become empty itself. An empty
//! branch root turns back into an empty leaf root instead of being freed,
//! since the root never moves.

use tracing::debug;

use arbor_common::{ArborError, Result, Row, Value};

use super::constants::FIRST_ROW_SLOT;
use super::control_row::{ControlInfo, ControlRow, NodeKind};
use super::open::OpenBTree;
use super::search::{PartialKeyOrder, SearchParameters};

/// Shrinks the subtree under `node` along `key`. Returns true if `node`
/// itself was removed from the tree, or for the root, emptied.
pub(crate) fn shrink_for(open: &OpenBTree, node: ControlRow, key: &[Value]) -> Result<bool> {
    match node.info().kind {
        NodeKind::Leaf => shrink_leaf(open, node),
        NodeKind::Branch { .. } => shrink_branch(open, node, key),
    }
}

fn shrink_leaf(open: &OpenBTree, leaf: ControlRow) -> Result<bool> {
    if leaf.row_count() == 0 && !leaf.is_root() {
        return leaf.unlink(open);
    }
    Ok(false)
}

fn shrink_branch(open: &OpenBTree, mut branch: ControlRow, key: &[Value]) -> Result<bool> {
    let mut sp = SearchParameters::new(key, PartialKeyOrder::Left, false);
    branch.search_for_entry(open, &mut sp)?;
    let slot = sp.result_slot;

    let child = branch.child_at_slot(open, slot)?;
    if !shrink_for(open, child, key)? {
        return Ok(false);
    }

    let log = open.log();
    if slot != 0 {
        branch.page_mut().purge_at_slot(log, slot, 1)?;
        return Ok(false);
    }

    // The left child went away
    if branch.row_count() > 0 {
        let promoted = branch.child_page_at_slot(open, FIRST_ROW_SLOT)?;
        branch.set_left_child(log, promoted)?;
        branch.page_mut().purge_at_slot(log, FIRST_ROW_SLOT, 1)?;
        return Ok(false);
    }

    if branch.is_root() {
        branch.rewrite(open, ControlInfo::root_leaf())?;
        debug!(container = open.container().id(), "root collapsed to empty leaf");
        return Ok(true);
    }
    branch.unlink(open)
}

/// Purges every delete-marked row of a leaf. Only valid while the table is
/// locked exclusively, when every delete mark belongs to a committed
/// transaction.
///
/// Returns a key that leads back to the leaf if the leaf ended up empty.
pub(crate) fn purge_committed_deletes(open: &OpenBTree, page_num: u32) -> Result<Option<Row>> {
    let mut leaf = match ControlRow::get(open, page_num) {
        Ok(leaf) => leaf,
        // Freed since the work was queued
        Err(ArborError::PageNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !leaf.is_leaf() {
        return Ok(None);
    }

    let mut shrink_key = None;
    let mut purged = 0;
    for slot in (FIRST_ROW_SLOT..leaf.record_count()).rev() {
        if leaf.page().is_deleted_at_slot(slot)? {
            if leaf.record_count() == FIRST_ROW_SLOT + 1 {
                shrink_key = Some(leaf.row_at(slot)?);
            }
            leaf.page_mut().purge_at_slot(open.log(), slot, 1)?;
            purged += 1;
        }
    }
    debug!(
        container = open.container().id(),
        page = page_num,
        purged,
        "committed deletes purged"
    );

    if leaf.row_count() == 0 && !leaf.is_root() {
        Ok(shrink_key)
    } else {
        Ok(None)
    }
}

/// Purges the delete-marked rows of a leaf that can be locked exclusively
/// without waiting. Slots are visited last to first so a purge never
/// shifts a slot not yet visited. Returns the number of rows purged.
pub(crate) fn purge_row_level_committed_deletes(open: &OpenBTree, leaf: &mut ControlRow) -> Result<usize> {
    let deleted = leaf.record_count() - leaf.page().non_deleted_record_count();
    if deleted == 0 || !open.lock_scan_for_reclaim(leaf.page_num())? {
        return Ok(0);
    }
    open.txn().save_scan_positions(leaf.page())?;

    let mut purged = 0;
    for slot in (FIRST_ROW_SLOT..leaf.record_count()).rev() {
        if leaf.page().is_deleted_at_slot(slot)? && open.lock_committed_deleted_row(leaf, slot)? {
            leaf.page_mut().purge_at_slot(open.log(), slot, 1)?;
            purged += 1;
        }
    }
    debug!(
        container = open.container().id(),
        page = leaf.page_num(),
        deleted,
        purged,
        "deleted rows reclaimed"
    );
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::locking::LockingPolicy;
    use crate::btree::test_support::{int_row, TestIndex};
    use arbor_common::{IndexConfig, RowLocation, TypeId};
    use arbor_txn::{LockKey, LockMode, LockWait};

    /// Root branch over leaves holding `per_leaf` consecutive keys each.
    fn two_level_tree(index: &TestIndex, open: &OpenBTree, leaves: i64, per_leaf: i64) {
        let mut root = open.root().unwrap();
        let mut pages = Vec::new();
        let mut prev: Option<ControlRow> = None;
        for l in 0..leaves {
            let mut leaf = ControlRow::allocate(open, ControlInfo::leaf(root.page_num())).unwrap();
            for i in 0..per_leaf {
                let k = l * per_leaf + i;
                leaf.page_mut()
                    .insert_at_slot(open.log(), (i + 1) as usize, &int_row(k), false)
                    .unwrap();
            }
            if let Some(mut p) = prev.take() {
                leaf.link_right(open, &mut p).unwrap();
            }
            pages.push(leaf.page_num());
            prev = Some(leaf);
        }
        drop(prev);
        for (i, page) in pages.iter().enumerate().skip(1) {
            let mut row = int_row(i as i64 * per_leaf);
            row.push(crate::btree::control_row::page_value(*page));
            root.page_mut()
                .insert_at_slot(open.log(), i, &row, false)
                .unwrap();
        }
        let info = ControlInfo {
            kind: NodeKind::Branch { left_child: pages[0] },
            level: 1,
            ..ControlInfo::root_leaf()
        };
        root.rewrite(open, info).unwrap();
        drop(root);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    fn delete_all(open: &OpenBTree, page: u32) {
        let mut leaf = ControlRow::get(open, page).unwrap();
        for slot in 1..leaf.record_count() {
            leaf.page_mut().delete_at_slot(open.log(), slot, true).unwrap();
        }
    }

    #[test]
    fn test_purge_and_shrink_middle_leaf() {
        let index = TestIndex::new(CreateIndex::new("r", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        two_level_tree(&index, &open, 3, 2);
        let middle = open.root().unwrap().child_page_at_slot(&open, 1).unwrap();
        delete_all(&open, middle);

        let key = purge_committed_deletes(&open, middle).unwrap().unwrap();
        assert_eq!(key, int_row(2));
        assert!(!shrink_for(&open, open.root().unwrap(), &key).unwrap());

        assert!(!open.container().page_numbers().contains(&middle));
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap(), vec![4, 1]);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_shrink_left_child_promotes_next() {
        let index = TestIndex::new(CreateIndex::new("r", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        two_level_tree(&index, &open, 3, 2);
        let first = open.root().unwrap().left_child().unwrap();
        delete_all(&open, first);

        let key = purge_committed_deletes(&open, first).unwrap().unwrap();
        shrink_for(&open, open.root().unwrap(), &key).unwrap();

        let root = open.root().unwrap();
        assert_ne!(root.left_child(), Some(first));
        assert_eq!(root.row_count(), 1);
        drop(root);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_emptied_branch_root_becomes_leaf() {
        let index = TestIndex::new(CreateIndex::new("r", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        two_level_tree(&index, &open, 2, 2);
        for _ in 0..2 {
            let first = open.root().unwrap().left_child().unwrap();
            delete_all(&open, first);
            let key = purge_committed_deletes(&open, first).unwrap().unwrap();
            shrink_for(&open, open.root().unwrap(), &key).unwrap();
        }
        // The last leaf is leftmost and rightmost, so it unlinks with no
        // siblings and the root folds back to a leaf
        let root = open.root().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.row_count(), 0);
        drop(root);
        assert_eq!(index.btree.height(&index.txn).unwrap(), 1);
    }

    #[test]
    fn test_root_leaf_is_never_unlinked() {
        let index = TestIndex::new(CreateIndex::new("r", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        assert!(!shrink_for(&open, open.root().unwrap(), &int_row(1)).unwrap());
        assert!(purge_committed_deletes(&open, 1).unwrap().is_none());
    }

    #[test]
    fn test_row_level_purge_skips_locked_rows() {
        let index = TestIndex::new(CreateIndex::new("r", 1, &[TypeId::Int64]));
        let open = OpenBTree::open(
            index.btree.clone(),
            index.txn.clone(),
            LockingPolicy::RowSerializable,
            &IndexConfig::default(),
            true,
        )
        .unwrap();
        let mut root = open.root().unwrap();
        for k in 1..=3 {
            root.page_mut()
                .insert_at_slot(open.log(), k as usize, &int_row(k), true)
                .unwrap();
        }

        // Row 2's deleter is still active
        let other = index.mgr.begin();
        let key = LockKey::Row {
            container_id: 1,
            location: RowLocation::new(1, 2),
        };
        assert!(other.lock(key, LockMode::Exclusive, LockWait::NoWait).unwrap());

        let purged = purge_row_level_committed_deletes(&open, &mut root).unwrap();
        assert_eq!(purged, 2);
        assert_eq!(root.row_count(), 1);
        assert_eq!(root.row_at(1).unwrap(), int_row(2));
        drop(root);
        other.commit().unwrap();
    }
}

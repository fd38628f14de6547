//! Top-down structure modification: page split and root growth.
//!
//! A split pass starts at the root and walks toward the leaf that must
//! take `split_row`, splitting every full page it meets on the way, so a
//! page is only ever split when its parent already has room for the new
//! branch row. Each level is committed on its own in the internal
//! transaction driving the pass.
//!
//! ```text
//!           parent                         parent
//!        [ .. | k1 | .. ]              [ .. | k1 | ks | .. ]
//!               |            ==>               |    |
//!        [ a b c d e f ]               [ a b c ] -> [ d e f ]
//!              leaf                     leaf        new leaf
//! ```
//!
//! The root stays at page 1: growing the tree moves the root's rows into a
//! new page below it and rewrites the root as a branch one level taller.
//! When a parent cannot take the branch row of a split, the pass restarts
//! from the root with that branch row as its target, which splits the
//! parent first.

use std::cmp::Ordering;

use tracing::{debug, trace};

use arbor_common::{ArborError, Result, Value, INVALID_PAGE_NUM};

use super::constants::{FIRST_ROW_SLOT, SPLIT_FLAG_FIRST_ON_PAGE, SPLIT_FLAG_LAST_ON_PAGE};
use super::control_row::{fits_on_empty_leaf, page_value, ControlInfo, ControlRow, NodeKind};
use super::open::OpenBTree;
use super::search::{compare_index_row_to_key, PartialKeyOrder, SearchParameters};

/// Makes room for `split_row` below `node`. Returns the page number of the
/// leaf the pass ended on; the caller searches again before inserting.
pub(crate) fn split_for(
    open: &OpenBTree,
    node: ControlRow,
    parent: Option<ControlRow>,
    split_row: &[Value],
    flag: u32,
) -> Result<u32> {
    match node.info().kind {
        NodeKind::Leaf => split_leaf(open, node, parent, split_row, flag),
        NodeKind::Branch { .. } => split_branch(open, node, parent, split_row, flag),
    }
}

fn split_point(node: &ControlRow, flag: u32) -> usize {
    let record_count = node.record_count();
    if flag & SPLIT_FLAG_FIRST_ON_PAGE != 0 {
        FIRST_ROW_SLOT
    } else if flag & SPLIT_FLAG_LAST_ON_PAGE != 0 {
        record_count - 1
    } else {
        (record_count - 1) / 2 + 1
    }
}

/// Gives up the current pass and starts again from the root, targeting the
/// branch row the parent had no room for.
fn restart_split_for(
    open: &OpenBTree,
    parent: ControlRow,
    child: ControlRow,
    new_branch_row: Vec<Value>,
    flag: u32,
) -> Result<u32> {
    trace!(
        container = open.container().id(),
        parent = parent.page_num(),
        child = child.page_num(),
        "parent full, restarting split from root"
    );
    drop(parent);
    drop(child);
    let root = open.root()?;
    split_for(open, root, None, &new_branch_row, flag)
}

/// Inserts a branch row for a new child into the parent, after the last
/// row that sorts before it.
fn insert_branch_row(open: &OpenBTree, parent: &mut ControlRow, branch_row: &[Value]) -> Result<()> {
    let mut sp = SearchParameters::new(branch_row, PartialKeyOrder::Left, false);
    parent.search_for_entry(open, &mut sp)?;
    let slot = sp.result_slot + 1;
    if parent
        .page_mut()
        .insert_at_slot(open.log(), slot, branch_row, false)?
        .is_none()
    {
        return Err(ArborError::NoSpaceForKey {
            container_id: open.container().id(),
            page_num: parent.page_num(),
        });
    }
    Ok(())
}

fn has_room(open: &OpenBTree, node: &ControlRow, row: &[Value]) -> bool {
    node.row_count() < open.max_rows_per_page() && node.page().space_for_insert(row)
}

// ============================================================================
// Leaf
// ============================================================================

fn split_leaf(
    open: &OpenBTree,
    mut leaf: ControlRow,
    parent: Option<ControlRow>,
    split_row: &[Value],
    flag: u32,
) -> Result<u32> {
    if has_room(open, &leaf, split_row) {
        open.txn().commit_and_continue()?;
        return Ok(leaf.page_num());
    }
    // No split can make room for a row too large for any leaf
    if !fits_on_empty_leaf(open, split_row) {
        return Err(ArborError::NoSpaceForKey {
            container_id: open.container().id(),
            page_num: leaf.page_num(),
        });
    }

    if leaf.is_root() {
        drop(parent);
        grow_leaf_root(open, leaf)?;
        let root = open.root()?;
        return split_for(open, root, None, split_row, flag);
    }
    let mut parent = parent.ok_or_else(|| leaf.corrupted("non-root page split without parent".to_string()))?;

    if leaf.row_count() == 0 {
        return Err(ArborError::NoSpaceForKey {
            container_id: open.container().id(),
            page_num: leaf.page_num(),
        });
    }

    let split_point = split_point(&leaf, flag);
    let mut branch_row = leaf.row_at(split_point)?;
    branch_row.push(page_value(INVALID_PAGE_NUM));
    if !parent.page().space_for_insert(&branch_row) {
        return restart_split_for(open, parent, leaf, branch_row, flag);
    }

    // Scans of this transaction move off the page by key before any row
    // moves; scans of others block the split through their scan locks.
    open.txn().save_scan_positions(leaf.page())?;
    if let Some(blocked) = open.lock_scan(leaf.page_num(), true)? {
        let current = leaf.page_num();
        drop(parent);
        drop(leaf);
        open.wait_for(blocked)?;
        trace!(container = open.container().id(), page = current, "split waited for scan lock");
        return Ok(current);
    }

    let mut new_leaf = ControlRow::allocate(open, ControlInfo::leaf(parent.page_num()))?;
    new_leaf.link_right(open, &mut leaf)?;

    let moved = leaf.record_count() - split_point;
    leaf.page_mut().copy_and_purge(
        open.log(),
        new_leaf.page_mut(),
        split_point,
        moved,
        FIRST_ROW_SLOT,
    )?;

    let new_page = new_leaf.page_num();
    if let Some(child) = branch_row.last_mut() {
        *child = page_value(new_page);
    }
    insert_branch_row(open, &mut parent, &branch_row)?;

    open.txn().commit_and_continue()?;
    debug!(
        container = open.container().id(),
        page = leaf.page_num(),
        new_page,
        parent = parent.page_num(),
        moved,
        "leaf split"
    );
    Ok(new_page)
}

/// Moves the rows of a full root leaf into a new leaf and turns the root
/// into a branch pointing at it.
fn grow_leaf_root(open: &OpenBTree, mut root: ControlRow) -> Result<()> {
    open.txn().save_scan_positions(root.page())?;
    if let Some(blocked) = open.lock_scan(root.page_num(), true)? {
        drop(root);
        open.wait_for(blocked)?;
        trace!(container = open.container().id(), "root growth waited for scan lock");
        return Ok(());
    }

    let mut new_leaf = ControlRow::allocate(open, ControlInfo::leaf(root.page_num()))?;
    let moved = root.row_count();
    root.page_mut().copy_and_purge(
        open.log(),
        new_leaf.page_mut(),
        FIRST_ROW_SLOT,
        moved,
        FIRST_ROW_SLOT,
    )?;

    let info = ControlInfo {
        kind: NodeKind::Branch {
            left_child: new_leaf.page_num(),
        },
        level: 1,
        ..ControlInfo::root_leaf()
    };
    root.rewrite(open, info)?;

    open.txn().commit_and_continue()?;
    debug!(
        container = open.container().id(),
        leaf = new_leaf.page_num(),
        moved,
        "root grown from leaf"
    );
    Ok(())
}

// ============================================================================
// Branch
// ============================================================================

fn split_branch(
    open: &OpenBTree,
    mut branch: ControlRow,
    parent: Option<ControlRow>,
    split_row: &[Value],
    flag: u32,
) -> Result<u32> {
    if has_room(open, &branch, split_row) {
        drop(parent);
        let mut sp = SearchParameters::new(split_row, PartialKeyOrder::Left, false);
        branch.search_for_entry(open, &mut sp)?;
        let child = branch.child_at_slot(open, sp.result_slot)?;
        return split_for(open, child, Some(branch), split_row, flag);
    }

    if branch.row_count() == 0 {
        return Err(ArborError::NoSpaceForKey {
            container_id: open.container().id(),
            page_num: branch.page_num(),
        });
    }

    if branch.is_root() {
        drop(parent);
        grow_branch_root(open, branch)?;
        let root = open.root()?;
        return split_for(open, root, None, split_row, flag);
    }
    let mut parent = parent.ok_or_else(|| branch.corrupted("non-root page split without parent".to_string()))?;

    let split_point = split_point(&branch, flag);
    let split_branch_row = branch.row_at(split_point)?;
    let mut new_branch_row = split_branch_row.clone();
    if !parent.page().space_for_insert(&new_branch_row) {
        return restart_split_for(open, parent, branch, new_branch_row, flag);
    }

    // The child of the split row becomes the left child of the new branch
    let child_page = branch.child_page_at_slot(open, split_point)?;
    let mut new_branch = ControlRow::allocate(
        open,
        ControlInfo::branch(child_page, branch.level(), parent.page_num()),
    )?;
    new_branch.link_right(open, &mut branch)?;

    let new_page = new_branch.page_num();
    if let Some(child) = new_branch_row.last_mut() {
        *child = page_value(new_page);
    }
    insert_branch_row(open, &mut parent, &new_branch_row)?;

    let moved = branch.record_count() - split_point - 1;
    if moved > 0 {
        branch.page_mut().copy_and_purge(
            open.log(),
            new_branch.page_mut(),
            split_point + 1,
            moved,
            FIRST_ROW_SLOT,
        )?;
    }
    branch.page_mut().purge_at_slot(open.log(), split_point, 1)?;

    if open.conglomerate().maintain_parent_links() {
        new_branch.fix_childrens_parents(open)?;
    }

    open.txn().commit_and_continue()?;
    debug!(
        container = open.container().id(),
        page = branch.page_num(),
        new_page,
        level = branch.level(),
        moved,
        "branch split"
    );

    // Carry on down whichever half now covers the row
    let key_columns = split_branch_row.len() - 1;
    let ord = compare_index_row_to_key(
        split_row,
        &split_branch_row,
        key_columns,
        Ordering::Equal,
        open.conglomerate().columns(),
    );
    if ord != Ordering::Less {
        drop(branch);
        split_for(open, new_branch, Some(parent), split_row, flag)
    } else {
        drop(new_branch);
        split_for(open, branch, Some(parent), split_row, flag)
    }
}

/// Moves the rows of a full root branch into a new branch and makes that
/// branch the root's only child.
fn grow_branch_root(open: &OpenBTree, mut root: ControlRow) -> Result<()> {
    let left_child = root
        .left_child()
        .ok_or_else(|| root.corrupted("branch root without left child".to_string()))?;
    let mut branch = ControlRow::allocate(
        open,
        ControlInfo::branch(left_child, root.level(), root.page_num()),
    )?;

    let moved = root.row_count();
    root.page_mut().copy_and_purge(
        open.log(),
        branch.page_mut(),
        FIRST_ROW_SLOT,
        moved,
        FIRST_ROW_SLOT,
    )?;

    let info = ControlInfo {
        kind: NodeKind::Branch {
            left_child: branch.page_num(),
        },
        level: root.level() + 1,
        ..ControlInfo::root_leaf()
    };
    root.rewrite(open, info)?;

    if open.conglomerate().maintain_parent_links() {
        branch.fix_childrens_parents(open)?;
    }

    open.txn().commit_and_continue()?;
    debug!(
        container = open.container().id(),
        branch = branch.page_num(),
        level = root.level(),
        moved,
        "root grown from branch"
    );
    Ok(())
}

impl ControlRow {
    /// Points the parent link of every child of this branch back at it.
    pub(crate) fn fix_childrens_parents(&self, open: &OpenBTree) -> Result<()> {
        let parent = self.page_num();
        for slot in 0..self.record_count() {
            let mut child = self.child_at_slot(open, slot)?;
            if child.parent() != parent {
                child.set_parent(open.log(), parent)?;
            }
        }
        Ok(())
    }
}

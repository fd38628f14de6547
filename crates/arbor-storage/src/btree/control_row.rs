//! Control rows: the page metadata kept in slot 0 of every index page.
//!
//! ```text
//! slot 0 columns
//! +--------+------+-------+--------+-------+---------+------------+------------+
//! | format | left | right | parent | level | is_root | descriptor | left_child |
//! +--------+------+-------+--------+-------+---------+------------+------------+
//!   i32      i64    i64     i64      i32     bool      varbinary    i64
//!                                                      root only    branch only
//! ```
//!
//! A `ControlRow` owns the latch on its page. The parsed fields are cached
//! as the page's aux object together with the search hint, so a page
//! latched again later skips the parse. Every setter writes the page and
//! the cache together; rollback drops the cache and the next latch parses
//! slot 0 again.

use std::cmp::Ordering;

use arbor_buffer::{FetchDescriptor, PageLatch};
use arbor_common::{ArborError, Result, Row, Value, FIRST_PAGE_NUM, INVALID_PAGE_NUM};
use arbor_wal::UndoLog;

use super::conglomerate::BTree;
use super::constants::{
    BRANCH_FORMAT, COLUMN_DESCRIPTOR, COLUMN_FORMAT, COLUMN_IS_ROOT, COLUMN_LEFT_CHILD,
    COLUMN_LEFT_SIBLING, COLUMN_LEVEL, COLUMN_PARENT, COLUMN_RIGHT_SIBLING, CONTROL_ROW_COLUMNS,
    CONTROL_SLOT, FIRST_ROW_SLOT, LEAF_FORMAT,
};
use super::open::OpenBTree;
use super::search::compare_index_row_to_key;

/// Which kind of page a control row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Leaf,
    Branch { left_child: u32 },
}

/// The fields of a control row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlInfo {
    pub kind: NodeKind,
    pub left_sibling: u32,
    pub right_sibling: u32,
    pub parent: u32,
    pub level: u32,
    pub is_root: bool,
}

impl ControlInfo {
    /// The control row of a new, empty index.
    pub fn root_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            left_sibling: INVALID_PAGE_NUM,
            right_sibling: INVALID_PAGE_NUM,
            parent: INVALID_PAGE_NUM,
            level: 0,
            is_root: true,
        }
    }

    /// A non-root leaf with no siblings yet.
    pub fn leaf(parent: u32) -> Self {
        Self {
            parent,
            is_root: false,
            ..Self::root_leaf()
        }
    }

    /// A non-root branch with no siblings yet.
    pub fn branch(left_child: u32, level: u32, parent: u32) -> Self {
        Self {
            kind: NodeKind::Branch { left_child },
            left_sibling: INVALID_PAGE_NUM,
            right_sibling: INVALID_PAGE_NUM,
            parent,
            level,
            is_root: false,
        }
    }

    fn to_row(self, descriptor: Option<&BTree>) -> Row {
        let (format, left_child) = match self.kind {
            NodeKind::Leaf => (LEAF_FORMAT, Value::Null),
            NodeKind::Branch { left_child } => (BRANCH_FORMAT, page_value(left_child)),
        };
        let descriptor = match descriptor {
            Some(btree) => Value::Varbinary(btree.encode()),
            None => Value::Null,
        };
        vec![
            Value::Int32(format),
            page_value(self.left_sibling),
            page_value(self.right_sibling),
            page_value(self.parent),
            Value::Int32(self.level as i32),
            Value::Boolean(self.is_root),
            descriptor,
            left_child,
        ]
    }

    fn from_row(row: &[Value], container_id: u32, page_num: u32) -> Result<Self> {
        let corrupted = |reason: &str| ArborError::BTreeCorrupted {
            container_id,
            page_num,
            reason: format!("control row: {}", reason),
        };
        if row.len() != CONTROL_ROW_COLUMNS {
            return Err(corrupted(&format!("{} columns", row.len())));
        }
        let page_at = |column: usize, name: &str| {
            page_from_value(&row[column]).ok_or_else(|| corrupted(name))
        };

        let kind = match row[COLUMN_FORMAT].as_i64() {
            Some(f) if f == LEAF_FORMAT as i64 => NodeKind::Leaf,
            Some(f) if f == BRANCH_FORMAT as i64 => NodeKind::Branch {
                left_child: page_at(COLUMN_LEFT_CHILD, "bad left child")?,
            },
            _ => return Err(corrupted("unknown format tag")),
        };
        let level = row[COLUMN_LEVEL]
            .as_i64()
            .and_then(|l| u32::try_from(l).ok())
            .ok_or_else(|| corrupted("bad level"))?;
        let is_root = row[COLUMN_IS_ROOT]
            .as_bool()
            .ok_or_else(|| corrupted("bad root flag"))?;

        Ok(Self {
            kind,
            left_sibling: page_at(COLUMN_LEFT_SIBLING, "bad left sibling")?,
            right_sibling: page_at(COLUMN_RIGHT_SIBLING, "bad right sibling")?,
            parent: page_at(COLUMN_PARENT, "bad parent")?,
            level,
            is_root,
        })
    }
}

#[inline]
pub(crate) fn page_value(page_num: u32) -> Value {
    Value::Int64(page_num as i64)
}

#[inline]
pub(crate) fn page_from_value(value: &Value) -> Option<u32> {
    value.as_i64().and_then(|v| u32::try_from(v).ok())
}

/// Returns true if `row` fits on a leaf of its own next to a control row.
pub(crate) fn fits_on_empty_leaf(open: &OpenBTree, row: &[Value]) -> bool {
    let control = ControlInfo::leaf(INVALID_PAGE_NUM).to_row(None);
    open.container().rows_fit_on_empty_page(&[&control, row])
}

/// Aux object cached on each index page.
struct PageCache {
    info: ControlInfo,
    last_search_result: usize,
    use_hint: bool,
}

/// A latched index page and its control row.
pub(crate) struct ControlRow {
    page: PageLatch,
    info: ControlInfo,
}

impl ControlRow {
    /// Latches a page, waiting if another thread holds it.
    pub fn get(open: &OpenBTree, page_num: u32) -> Result<ControlRow> {
        let page = open
            .container()
            .get_page(page_num)
            .ok_or(ArborError::PageNotFound {
                container_id: open.container().id(),
                page_num,
            })?;
        ControlRow::from_latch(page)
    }

    /// Latches a page without waiting. `None` means another thread holds it.
    pub fn get_no_wait(open: &OpenBTree, page_num: u32) -> Result<Option<ControlRow>> {
        match open.container().get_page_no_wait(page_num) {
            Some(page) => Ok(Some(ControlRow::from_latch(page)?)),
            None if open.container().contains_page(page_num) => Ok(None),
            None => Err(ArborError::PageNotFound {
                container_id: open.container().id(),
                page_num,
            }),
        }
    }

    fn from_latch(mut page: PageLatch) -> Result<ControlRow> {
        if let Some(cache) = page.aux::<PageCache>() {
            let info = cache.info;
            return Ok(ControlRow { page, info });
        }

        if page.record_count() == 0 {
            return Err(ArborError::BTreeCorrupted {
                container_id: page.container().id(),
                page_num: page.page_num(),
                reason: "page has no control row".to_string(),
            });
        }
        let columns: Vec<usize> = (0..CONTROL_ROW_COLUMNS)
            .filter(|&c| c != COLUMN_DESCRIPTOR)
            .collect();
        let desc = FetchDescriptor::new(CONTROL_ROW_COLUMNS, &columns);
        let row = page.fetch_from_slot(CONTROL_SLOT, Some(&desc))?;
        let info = ControlInfo::from_row(&row, page.container().id(), page.page_num())?;
        page.set_aux(PageCache {
            info,
            last_search_result: 0,
            use_hint: false,
        });
        Ok(ControlRow { page, info })
    }

    /// Writes the control row into slot 0 of a freshly added page.
    pub fn initialize(
        log: &UndoLog,
        mut page: PageLatch,
        info: ControlInfo,
        descriptor: Option<&BTree>,
    ) -> Result<ControlRow> {
        let row = info.to_row(descriptor);
        if page.insert_at_slot(log, CONTROL_SLOT, &row, false)?.is_none() {
            return Err(ArborError::NoSpaceForKey {
                container_id: page.container().id(),
                page_num: page.page_num(),
            });
        }
        page.set_aux(PageCache {
            info,
            last_search_result: 0,
            use_hint: false,
        });
        Ok(ControlRow { page, info })
    }

    /// Adds a page to the index and initializes its control row.
    pub fn allocate(open: &OpenBTree, info: ControlInfo) -> Result<ControlRow> {
        let page = open.container().add_page(open.log())?;
        ControlRow::initialize(open.log(), page, info, None)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn page(&self) -> &PageLatch {
        &self.page
    }

    #[inline]
    pub fn page_mut(&mut self) -> &mut PageLatch {
        &mut self.page
    }

    #[inline]
    pub fn into_page(self) -> PageLatch {
        self.page
    }

    #[inline]
    pub fn info(&self) -> ControlInfo {
        self.info
    }

    #[inline]
    pub fn page_num(&self) -> u32 {
        self.page.page_num()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.info.kind == NodeKind::Leaf
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.info.is_root
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.info.level
    }

    #[inline]
    pub fn left_sibling(&self) -> u32 {
        self.info.left_sibling
    }

    #[inline]
    pub fn right_sibling(&self) -> u32 {
        self.info.right_sibling
    }

    #[inline]
    pub fn parent(&self) -> u32 {
        self.info.parent
    }

    /// Left child of a branch, `None` for a leaf.
    #[inline]
    pub fn left_child(&self) -> Option<u32> {
        match self.info.kind {
            NodeKind::Leaf => None,
            NodeKind::Branch { left_child } => Some(left_child),
        }
    }

    #[inline]
    pub fn is_leftmost(&self) -> bool {
        self.info.left_sibling == INVALID_PAGE_NUM
    }

    #[inline]
    pub fn is_rightmost(&self) -> bool {
        self.info.right_sibling == INVALID_PAGE_NUM
    }

    /// Records on the page, control row included.
    #[inline]
    pub fn record_count(&self) -> usize {
        self.page.record_count()
    }

    /// Index or branch rows on the page.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.page.record_count().saturating_sub(1)
    }

    /// Fetches a whole row.
    pub fn row_at(&self, slot: usize) -> Result<Row> {
        self.page.fetch_from_slot(slot, None)
    }

    /// Child page of a branch row. Slot 0 stands for the left child.
    pub fn child_page_at_slot(&self, open: &OpenBTree, slot: usize) -> Result<u32> {
        if slot == CONTROL_SLOT {
            return self
                .left_child()
                .ok_or_else(|| self.corrupted("leaf has no children".to_string()));
        }
        let value = self
            .page
            .fetch_field_from_slot(slot, open.conglomerate().n_key_fields())?;
        page_from_value(&value)
            .ok_or_else(|| self.corrupted(format!("branch row {} has no child page", slot)))
    }

    /// Latches the child page reached through `slot`.
    pub fn child_at_slot(&self, open: &OpenBTree, slot: usize) -> Result<ControlRow> {
        ControlRow::get(open, self.child_page_at_slot(open, slot)?)
    }

    pub(crate) fn search_hint(&self) -> (usize, bool) {
        match self.page.aux::<PageCache>() {
            Some(cache) => (cache.last_search_result, cache.use_hint),
            None => (0, false),
        }
    }

    pub(crate) fn set_search_hint(&mut self, last_search_result: usize, use_hint: bool) {
        match self.page.aux_mut::<PageCache>() {
            Some(cache) => {
                cache.last_search_result = last_search_result;
                cache.use_hint = use_hint;
            }
            None => self.page.set_aux(PageCache {
                info: self.info,
                last_search_result,
                use_hint,
            }),
        }
    }

    pub(crate) fn corrupted(&self, reason: String) -> ArborError {
        ArborError::BTreeCorrupted {
            container_id: self.page.container().id(),
            page_num: self.page.page_num(),
            reason,
        }
    }

    // ========================================================================
    // Write-through setters
    // ========================================================================

    fn write_field(&mut self, log: &UndoLog, column: usize, value: Value) -> Result<()> {
        if !self
            .page
            .update_field_at_slot(log, CONTROL_SLOT, column, &value)?
        {
            return Err(self.corrupted(format!("control row column {} does not fit", column)));
        }
        self.sync_cache();
        Ok(())
    }

    fn sync_cache(&mut self) {
        let info = self.info;
        match self.page.aux_mut::<PageCache>() {
            Some(cache) => cache.info = info,
            None => self.page.set_aux(PageCache {
                info,
                last_search_result: 0,
                use_hint: false,
            }),
        }
    }

    pub fn set_left_sibling(&mut self, log: &UndoLog, page_num: u32) -> Result<()> {
        self.info.left_sibling = page_num;
        self.write_field(log, COLUMN_LEFT_SIBLING, page_value(page_num))
    }

    pub fn set_right_sibling(&mut self, log: &UndoLog, page_num: u32) -> Result<()> {
        self.info.right_sibling = page_num;
        self.write_field(log, COLUMN_RIGHT_SIBLING, page_value(page_num))
    }

    pub fn set_parent(&mut self, log: &UndoLog, page_num: u32) -> Result<()> {
        self.info.parent = page_num;
        self.write_field(log, COLUMN_PARENT, page_value(page_num))
    }

    pub fn set_left_child(&mut self, log: &UndoLog, page_num: u32) -> Result<()> {
        match self.info.kind {
            NodeKind::Branch { .. } => {
                self.info.kind = NodeKind::Branch {
                    left_child: page_num,
                };
                self.write_field(log, COLUMN_LEFT_CHILD, page_value(page_num))
            }
            NodeKind::Leaf => Err(self.corrupted("leaf has no left child".to_string())),
        }
    }

    /// Replaces the whole control row, turning a leaf into a branch or back.
    /// The root keeps its copy of the descriptor.
    pub fn rewrite(&mut self, open: &OpenBTree, info: ControlInfo) -> Result<()> {
        let descriptor = info.is_root.then(|| open.conglomerate().as_ref());
        let row = info.to_row(descriptor);
        if !self.page.update_at_slot(open.log(), CONTROL_SLOT, &row)? {
            return Err(self.corrupted("control row does not fit".to_string()));
        }
        self.info = info;
        self.sync_cache();
        self.set_search_hint(0, false);
        Ok(())
    }

    // ========================================================================
    // Siblings
    // ========================================================================

    /// Latches the right sibling, waiting if needed. Left-to-right order
    /// never deadlocks.
    pub fn right_sibling_page(&self, open: &OpenBTree) -> Result<Option<ControlRow>> {
        if self.is_rightmost() {
            return Ok(None);
        }
        ControlRow::get(open, self.info.right_sibling).map(Some)
    }

    /// Links `self`, a new page, in as the right sibling of `target`.
    pub fn link_right(&mut self, open: &OpenBTree, target: &mut ControlRow) -> Result<()> {
        let log = open.log();
        let mut right = target.right_sibling_page(open)?;

        let right_num = right.as_ref().map_or(INVALID_PAGE_NUM, ControlRow::page_num);
        self.set_right_sibling(log, right_num)?;
        self.set_left_sibling(log, target.page_num())?;
        if let Some(right) = right.as_mut() {
            right.set_left_sibling(log, self.page_num())?;
        }
        target.set_right_sibling(log, self.page_num())
    }

    /// Removes an empty page from its sibling chain and frees it.
    ///
    /// The left sibling is latched without waiting, against the usual
    /// order; if it is busy nothing changes and false is returned.
    pub fn unlink(self, open: &OpenBTree) -> Result<bool> {
        let mut left = if self.is_leftmost() {
            None
        } else {
            match ControlRow::get_no_wait(open, self.info.left_sibling)? {
                Some(left) => Some(left),
                None => {
                    tracing::trace!(
                        page = self.page_num(),
                        left = self.info.left_sibling,
                        "unlink skipped, left sibling busy"
                    );
                    return Ok(false);
                }
            }
        };
        let mut right = self.right_sibling_page(open)?;

        let log = open.log();
        let left_num = left.as_ref().map_or(INVALID_PAGE_NUM, ControlRow::page_num);
        let right_num = right.as_ref().map_or(INVALID_PAGE_NUM, ControlRow::page_num);
        if let Some(left) = left.as_mut() {
            left.set_right_sibling(log, right_num)?;
        }
        if let Some(right) = right.as_mut() {
            right.set_left_sibling(log, left_num)?;
        }

        let page_num = self.page_num();
        open.container().remove_page(self.page, log)?;
        tracing::debug!(
            container = open.container().id(),
            page = page_num,
            left = left_num,
            right = right_num,
            "page unlinked"
        );
        Ok(true)
    }

    // ========================================================================
    // Consistency checking
    // ========================================================================

    /// Checks this page and, for a branch, every page below it. Returns the
    /// number of pages checked.
    pub fn check_consistency(self, open: &OpenBTree, parent: Option<u32>) -> Result<usize> {
        self.check_generic(open, parent)?;
        if self.is_leaf() {
            return Ok(1);
        }

        let btree = open.conglomerate();
        let children = (0..self.record_count())
            .map(|slot| self.child_page_at_slot(open, slot))
            .collect::<Result<Vec<u32>>>()?;

        let mut pages = 1;
        for (slot, &child_num) in children.iter().enumerate() {
            let child = ControlRow::get(open, child_num)?;
            if child.level() + 1 != self.level() {
                return Err(self.corrupted(format!(
                    "child {} at level {} under level {}",
                    child_num,
                    child.level(),
                    self.level()
                )));
            }
            let expected_left = if slot == 0 {
                None
            } else {
                Some(children[slot - 1])
            };
            if let Some(left) = expected_left {
                if child.left_sibling() != left {
                    return Err(child.corrupted(format!(
                        "left sibling {} but branch order says {}",
                        child.left_sibling(),
                        left
                    )));
                }
            }
            if let Some(&right) = children.get(slot + 1) {
                if child.right_sibling() != right {
                    return Err(child.corrupted(format!(
                        "right sibling {} but branch order says {}",
                        child.right_sibling(),
                        right
                    )));
                }
            }

            if child.row_count() > 0 {
                let n_compare = btree.n_unique_columns();
                if slot > 0 {
                    let lower = self.row_at(slot)?;
                    let first = child.row_at(FIRST_ROW_SLOT)?;
                    let ord = compare_index_row_to_key(
                        &first,
                        &lower[..btree.n_key_fields()],
                        n_compare,
                        Ordering::Equal,
                        btree.columns(),
                    );
                    if ord == Ordering::Less {
                        return Err(child.corrupted(format!(
                            "first row sorts before branch row {} of page {}",
                            slot,
                            self.page_num()
                        )));
                    }
                }
                if slot + 1 < children.len() {
                    let upper = self.row_at(slot + 1)?;
                    let last = child.row_at(child.record_count() - 1)?;
                    let ord = compare_index_row_to_key(
                        &last,
                        &upper[..btree.n_key_fields()],
                        n_compare,
                        Ordering::Equal,
                        btree.columns(),
                    );
                    if ord != Ordering::Less {
                        return Err(child.corrupted(format!(
                            "last row does not sort before branch row {} of page {}",
                            slot + 1,
                            self.page_num()
                        )));
                    }
                }
            }

            pages += child.check_consistency(open, Some(self.page_num()))?;
        }
        Ok(pages)
    }

    fn check_generic(&self, open: &OpenBTree, parent: Option<u32>) -> Result<()> {
        let btree = open.conglomerate();
        let info = self.info;

        if info.is_root != (self.page_num() == FIRST_PAGE_NUM) {
            return Err(self.corrupted(format!("root flag {} on page", info.is_root)));
        }
        if info.is_root {
            if info.parent != INVALID_PAGE_NUM
                || info.left_sibling != INVALID_PAGE_NUM
                || info.right_sibling != INVALID_PAGE_NUM
            {
                return Err(self.corrupted("root has a parent or siblings".to_string()));
            }
            let descriptor = self
                .page
                .fetch_field_from_slot(CONTROL_SLOT, COLUMN_DESCRIPTOR)?;
            if descriptor.is_null() {
                return Err(self.corrupted("root carries no descriptor".to_string()));
            }
        }
        match info.kind {
            NodeKind::Leaf if info.level != 0 => {
                return Err(self.corrupted(format!("leaf at level {}", info.level)));
            }
            NodeKind::Branch { left_child } if info.level == 0 || left_child == INVALID_PAGE_NUM => {
                return Err(self.corrupted("branch at level 0 or without left child".to_string()));
            }
            _ => {}
        }
        if let Some(parent) = parent {
            if btree.maintain_parent_links() && info.parent != parent {
                return Err(self.corrupted(format!(
                    "parent is {} but reached from {}",
                    info.parent, parent
                )));
            }
        }

        self.check_row_order(btree)?;
        self.check_siblings(open)
    }

    fn check_row_order(&self, btree: &BTree) -> Result<()> {
        let mut previous: Option<Row> = None;
        for slot in FIRST_ROW_SLOT..self.record_count() {
            let row = self.row_at(slot)?;
            let expected = if self.is_leaf() {
                btree.n_key_fields()
            } else {
                btree.n_key_fields() + 1
            };
            if row.len() != expected {
                return Err(self.corrupted(format!(
                    "row {} has {} columns, expected {}",
                    slot,
                    row.len(),
                    expected
                )));
            }
            if let Some(prev) = &previous {
                let ord = compare_index_row_to_key(
                    prev,
                    &row[..btree.n_key_fields()],
                    btree.n_unique_columns(),
                    Ordering::Equal,
                    btree.columns(),
                );
                if ord != Ordering::Less {
                    return Err(self.corrupted(format!("rows {} and {} out of order", slot - 1, slot)));
                }
            }
            previous = Some(row);
        }
        Ok(())
    }

    fn check_siblings(&self, open: &OpenBTree) -> Result<()> {
        let btree = open.conglomerate();
        if let Some(right) = self.right_sibling_page(open)? {
            if right.left_sibling() != self.page_num() || right.level() != self.level() {
                return Err(self.corrupted(format!(
                    "right sibling {} points back to {} at level {}",
                    right.page_num(),
                    right.left_sibling(),
                    right.level()
                )));
            }
            if self.row_count() > 0 && right.row_count() > 0 {
                let last = self.row_at(self.record_count() - 1)?;
                let first = right.row_at(FIRST_ROW_SLOT)?;
                let ord = compare_index_row_to_key(
                    &last,
                    &first[..btree.n_key_fields()],
                    btree.n_unique_columns(),
                    Ordering::Equal,
                    btree.columns(),
                );
                if ord != Ordering::Less {
                    return Err(self.corrupted(format!(
                        "last row does not sort before first row of right sibling {}",
                        right.page_num()
                    )));
                }
            }
        }

        // Against latch order, so a busy left sibling is skipped
        if !self.is_leftmost() {
            if let Some(left) = ControlRow::get_no_wait(open, self.info.left_sibling)? {
                if left.right_sibling() != self.page_num() || left.level() != self.level() {
                    return Err(self.corrupted(format!(
                        "left sibling {} points on to {}",
                        left.page_num(),
                        left.right_sibling()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ControlRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRow")
            .field("page", &self.page_num())
            .field("info", &self.info)
            .field("records", &self.record_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::test_support::TestIndex;
    use arbor_common::TypeId;

    #[test]
    fn test_control_info_row_roundtrip() {
        let info = ControlInfo {
            kind: NodeKind::Branch { left_child: 9 },
            left_sibling: 3,
            right_sibling: 5,
            parent: 1,
            level: 2,
            is_root: false,
        };
        let row = info.to_row(None);
        assert_eq!(row.len(), CONTROL_ROW_COLUMNS);
        assert!(row[COLUMN_DESCRIPTOR].is_null());
        assert_eq!(ControlInfo::from_row(&row, 1, 4).unwrap(), info);

        let leaf = ControlInfo::leaf(7);
        let row = leaf.to_row(None);
        assert!(row[COLUMN_LEFT_CHILD].is_null());
        assert_eq!(ControlInfo::from_row(&row, 1, 4).unwrap(), leaf);
    }

    #[test]
    fn test_from_row_rejects_unknown_format() {
        let mut row = ControlInfo::root_leaf().to_row(None);
        row[COLUMN_FORMAT] = Value::Int32(99);
        assert!(matches!(
            ControlInfo::from_row(&row, 1, 1),
            Err(ArborError::BTreeCorrupted { .. })
        ));
    }

    #[test]
    fn test_root_faults_from_page_and_caches() {
        let index = TestIndex::new(CreateIndex::new("t", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let root = open.root().unwrap();
        assert!(root.is_root());
        assert!(root.is_leaf());
        assert_eq!(root.level(), 0);
        assert_eq!(root.row_count(), 0);
        let mut page = root.into_page();

        // Drop the cache: the next latch parses slot 0 again
        page.invalidate_aux();
        drop(page);
        let root = open.root().unwrap();
        assert_eq!(root.info(), ControlInfo::root_leaf());
    }

    #[test]
    fn test_setters_write_through() {
        let index = TestIndex::new(CreateIndex::new("t", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut leaf = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        leaf.set_left_sibling(open.log(), 11).unwrap();
        leaf.set_right_sibling(open.log(), 12).unwrap();
        leaf.set_parent(open.log(), 13).unwrap();
        assert!(leaf.set_left_child(open.log(), 14).is_err());
        let page_num = leaf.page_num();
        let mut page = leaf.into_page();
        page.invalidate_aux();
        drop(page);

        let leaf = ControlRow::get(&open, page_num).unwrap();
        assert_eq!(leaf.left_sibling(), 11);
        assert_eq!(leaf.right_sibling(), 12);
        assert_eq!(leaf.parent(), 13);
    }

    #[test]
    fn test_link_right_and_unlink() {
        let index = TestIndex::new(CreateIndex::new("t", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut a = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        let mut c = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        c.link_right(&open, &mut a).unwrap();
        let (a_num, c_num) = (a.page_num(), c.page_num());
        drop(c);

        let mut b = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        b.link_right(&open, &mut a).unwrap();
        let b_num = b.page_num();
        drop(a);
        drop(b);

        let c = ControlRow::get(&open, c_num).unwrap();
        assert_eq!(c.left_sibling(), b_num);
        drop(c);

        let b = ControlRow::get(&open, b_num).unwrap();
        assert_eq!((b.left_sibling(), b.right_sibling()), (a_num, c_num));
        assert!(b.unlink(&open).unwrap());

        let a = ControlRow::get(&open, a_num).unwrap();
        assert_eq!(a.right_sibling(), c_num);
        drop(a);
        let c = ControlRow::get(&open, c_num).unwrap();
        assert_eq!(c.left_sibling(), a_num);
        assert!(open.container().get_page(b_num).is_none());
    }

    #[test]
    fn test_unlink_gives_up_when_left_sibling_busy() {
        let index = TestIndex::new(CreateIndex::new("t", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut a = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        let mut b = ControlRow::allocate(&open, ControlInfo::leaf(1)).unwrap();
        b.link_right(&open, &mut a).unwrap();

        // `a` stays latched
        assert!(!b.unlink(&open).unwrap());
        assert_eq!(a.right_sibling(), open.container().page_numbers()[2]);
    }
}

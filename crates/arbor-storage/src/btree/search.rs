//! Key search within a page and descent from the root.
//!
//! A search binary-searches slots 1..N of a page for the last row that
//! sorts before the key. Only the first `n_unique_columns` columns take
//! part. When the key has fewer columns than that and matches a row on all
//! of them, the partial-key order decides which side of the matching rows
//! the search lands on: `Left` for GE and insert positioning, `Right` for
//! GT.
//!
//! Each page remembers the slot its last search ended on and starts the
//! next search there when the previous one also landed on it, which turns
//! in-order inserts and scans into one comparison per page.

use std::cmp::Ordering;

use arbor_common::{Result, Value};

use super::conglomerate::IndexColumn;
use super::constants::FIRST_ROW_SLOT;
use super::control_row::{ControlRow, NodeKind};
use super::open::OpenBTree;

/// Where a search lands among rows that match every column of a partial
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartialKeyOrder {
    /// Before the matching rows.
    Left,
    /// After the matching rows.
    Right,
}

impl PartialKeyOrder {
    /// How a matching index row compares against the key.
    #[inline]
    pub(crate) fn as_ordering(self) -> Ordering {
        match self {
            PartialKeyOrder::Left => Ordering::Greater,
            PartialKeyOrder::Right => Ordering::Less,
        }
    }
}

/// Compares an index row against a possibly partial key over the first
/// `n_compare` columns, honoring per-column sort direction.
///
/// Returns `partial` once the key runs out of columns with every compared
/// column equal.
pub(crate) fn compare_index_row_to_key(
    row: &[Value],
    key: &[Value],
    n_compare: usize,
    partial: Ordering,
    columns: &[IndexColumn],
) -> Ordering {
    for i in 0..n_compare {
        if i >= key.len() {
            return partial;
        }
        let ord = row[i].compare(&key[i]);
        if ord != Ordering::Equal {
            let ascending = columns.get(i).map_or(true, |c| c.ascending);
            return if ascending { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

/// Input and output of a search.
#[derive(Debug)]
pub(crate) struct SearchParameters<'a> {
    pub key: &'a [Value],
    pub partial_key_order: Ordering,
    /// Track the fraction of the key space left of the result.
    pub for_optimizer: bool,
    /// Slot of the last row before the key, or of the matching row.
    pub result_slot: usize,
    pub result_exact: bool,
    pub left_fraction: f64,
    pub current_fraction: f64,
}

impl<'a> SearchParameters<'a> {
    pub fn new(key: &'a [Value], order: PartialKeyOrder, for_optimizer: bool) -> Self {
        Self {
            key,
            partial_key_order: order.as_ordering(),
            for_optimizer,
            result_slot: 0,
            result_exact: false,
            left_fraction: 0.0,
            current_fraction: 1.0,
        }
    }
}

impl ControlRow {
    /// Binary-searches this page for the key.
    pub(crate) fn search_for_entry(
        &mut self,
        open: &OpenBTree,
        sp: &mut SearchParameters<'_>,
    ) -> Result<()> {
        let btree = open.conglomerate();
        let n_compare = btree.n_unique_columns();

        let mut left_range = FIRST_ROW_SLOT;
        let mut right_range = self.record_count() - 1;
        let mut left_slot = 0;
        let mut right_slot = right_range + 1;

        let (last, use_hint) = self.search_hint();
        let mut mid = if use_hint {
            (if last == 0 { 1 } else { last }).min(right_range)
        } else {
            (left_range + right_range) / 2
        };

        while left_slot != right_slot - 1 {
            let row = self.row_at(mid)?;
            match compare_index_row_to_key(
                &row,
                sp.key,
                n_compare,
                sp.partial_key_order,
                btree.columns(),
            ) {
                Ordering::Equal => {
                    sp.result_slot = mid;
                    sp.result_exact = true;
                    self.set_search_hint(mid, mid == last);
                    return Ok(());
                }
                Ordering::Greater => {
                    right_slot = mid;
                    right_range = mid.saturating_sub(1);
                }
                Ordering::Less => {
                    left_slot = mid;
                    left_range = mid + 1;
                }
            }
            mid = (left_range + right_range) / 2;
        }

        self.set_search_hint(left_slot, left_slot == last);
        sp.result_slot = left_slot;
        sp.result_exact = false;
        Ok(())
    }

    /// Searches down from this page to the leaf that holds the key. Each
    /// page is released once its child is latched.
    pub(crate) fn search(self, open: &OpenBTree, sp: &mut SearchParameters<'_>) -> Result<ControlRow> {
        let mut node = self;
        loop {
            node.search_for_entry(open, sp)?;
            match node.info().kind {
                NodeKind::Leaf => {
                    if sp.for_optimizer {
                        node.leaf_search_fraction(sp)?;
                    }
                    return Ok(node);
                }
                NodeKind::Branch { .. } => {
                    if sp.for_optimizer {
                        if node.is_root() {
                            sp.current_fraction = 1.0;
                            sp.left_fraction = 0.0;
                        }
                        let children = node.record_count() as f64;
                        sp.left_fraction += sp.current_fraction * (sp.result_slot as f64 / children);
                        sp.current_fraction *= 1.0 / children;
                    }
                    let child = node.child_at_slot(open, sp.result_slot)?;
                    node = child;
                }
            }
        }
    }

    /// Fraction of the leaf's live rows left of the search result.
    fn leaf_search_fraction(&self, sp: &mut SearchParameters<'_>) -> Result<()> {
        let mut start_slot = sp.result_slot;
        if sp.result_exact && sp.partial_key_order == Ordering::Greater {
            start_slot = start_slot.saturating_sub(1);
        }
        let mut left_rows = 0usize;
        for slot in FIRST_ROW_SLOT..=start_slot {
            if !self.page().is_deleted_at_slot(slot)? {
                left_rows += 1;
            }
        }

        if self.is_root() {
            sp.current_fraction = 1.0;
            sp.left_fraction = 0.0;
        }
        let live = self.page().non_deleted_record_count();
        if live > 1 {
            let rows = (live - 1) as f64;
            sp.left_fraction += sp.current_fraction * (left_rows as f64 / rows);
            sp.current_fraction *= 1.0 / rows;
        }
        Ok(())
    }

    /// Descends along left children to the leftmost leaf.
    pub(crate) fn search_left(self, open: &OpenBTree) -> Result<ControlRow> {
        let mut node = self;
        while let Some(child) = node.left_child() {
            node = ControlRow::get(open, child)?;
        }
        Ok(node)
    }

    /// Descends along the last child of each branch to the rightmost leaf.
    pub(crate) fn search_right(self, open: &OpenBTree) -> Result<ControlRow> {
        let mut node = self;
        while !node.is_leaf() {
            let last = node.record_count() - 1;
            node = node.child_at_slot(open, last)?;
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::test_support::{int_row, TestIndex};
    use arbor_common::TypeId;

    fn columns() -> Vec<IndexColumn> {
        vec![
            IndexColumn::asc(TypeId::Int32),
            IndexColumn::desc(TypeId::Int32),
        ]
    }

    #[test]
    fn test_compare_respects_direction() {
        let cols = columns();
        let row = [Value::Int32(5), Value::Int32(1)];
        assert_eq!(
            compare_index_row_to_key(&row, &[Value::Int32(6)], 2, Ordering::Greater, &cols),
            Ordering::Less
        );
        // Second column is descending
        assert_eq!(
            compare_index_row_to_key(
                &row,
                &[Value::Int32(5), Value::Int32(2)],
                2,
                Ordering::Equal,
                &cols
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compare_partial_key_returns_order() {
        let cols = columns();
        let row = [Value::Int32(5), Value::Int32(1)];
        let key = [Value::Int32(5)];
        assert_eq!(
            compare_index_row_to_key(&row, &key, 2, PartialKeyOrder::Left.as_ordering(), &cols),
            Ordering::Greater
        );
        assert_eq!(
            compare_index_row_to_key(&row, &key, 2, PartialKeyOrder::Right.as_ordering(), &cols),
            Ordering::Less
        );
        assert_eq!(
            compare_index_row_to_key(&row, &key, 1, Ordering::Greater, &cols),
            Ordering::Equal
        );
    }

    #[test]
    fn test_search_for_entry_on_leaf() {
        let index = TestIndex::new(CreateIndex::new("s", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut root = open.root().unwrap();
        for (slot, k) in [10, 20, 30, 40].iter().enumerate() {
            root.page_mut()
                .insert_at_slot(open.log(), slot + 1, &int_row(*k), false)
                .unwrap();
        }

        let key = int_row(30);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert!(sp.result_exact);
        assert_eq!(sp.result_slot, 3);

        let key = int_row(25);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert!(!sp.result_exact);
        assert_eq!(sp.result_slot, 2);

        let key = int_row(5);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!((sp.result_slot, sp.result_exact), (0, false));

        let key = int_row(99);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!((sp.result_slot, sp.result_exact), (4, false));
    }

    #[test]
    fn test_partial_key_positions_around_matches() {
        let index = TestIndex::new(CreateIndex::new("s", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut root = open.root().unwrap();
        // Same key, different row locations
        for (slot, rid) in [1u32, 2, 3].iter().enumerate() {
            let row = vec![
                Value::Int64(7),
                Value::RowLocation(arbor_common::RowLocation::new(1, *rid)),
            ];
            root.page_mut()
                .insert_at_slot(open.log(), slot + 1, &row, false)
                .unwrap();
        }

        let key = [Value::Int64(7)];
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!((sp.result_slot, sp.result_exact), (0, false));

        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Right, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!((sp.result_slot, sp.result_exact), (3, false));
    }

    #[test]
    fn test_hint_follows_sequential_search() {
        let index = TestIndex::new(CreateIndex::new("s", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut root = open.root().unwrap();
        for k in 1..=8 {
            root.page_mut()
                .insert_at_slot(open.log(), k as usize, &int_row(k), false)
                .unwrap();
        }
        let key = int_row(100);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!(root.search_hint(), (8, false));
        root.search_for_entry(&open, &mut sp).unwrap();
        assert_eq!(root.search_hint(), (8, true));
        assert_eq!(sp.result_slot, 8);
    }

    #[test]
    fn test_leaf_fraction_for_optimizer() {
        let index = TestIndex::new(CreateIndex::new("s", 1, &[TypeId::Int64]));
        let open = index.open_unlocked();
        let mut root = open.root().unwrap();
        for k in 1..=5 {
            root.page_mut()
                .insert_at_slot(open.log(), k as usize, &int_row(k * 10), false)
                .unwrap();
        }
        drop(root);

        let key = int_row(30);
        let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, true);
        let leaf = open.root().unwrap().search(&open, &mut sp).unwrap();
        assert!(leaf.is_leaf());
        // Rows 10 and 20 lie left of 30: two of five rows
        assert!((sp.left_fraction - 0.4).abs() < 1e-9);
    }
}

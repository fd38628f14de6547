//! Fetching the greatest row of an index.
//!
//! The greatest row is almost always at the end of the rightmost leaf, so
//! that leaf is read backwards first. Only if it holds no usable row, or a
//! row lock there cannot be had without waiting, does the fetch fall back
//! to a full forward scan. NULLs sort highest and never count as the
//! maximum.
//!
//! When the first key column is descending the greatest value sits at the
//! left end instead, so the fetch goes straight to the forward scan and
//! stops at the first non-NULL row.

use std::sync::Arc;

use tracing::debug;

use arbor_buffer::FetchDescriptor;
use arbor_common::{ArborError, IndexConfig, Result, Row, RowLocation, Value};
use arbor_txn::Transaction;

use super::conglomerate::BTree;
use super::constants::FIRST_ROW_SLOT;
use super::locking::{row_location_at, LockingPolicy};
use super::open::OpenBTree;
use super::scan::{BTreeScan, ScanParams};

enum Backward {
    Found(Row, RowLocation),
    /// Nothing usable on the rightmost leaf, or a row lock would block.
    FallBack,
}

pub(crate) fn fetch_max(
    btree: &Arc<BTree>,
    txn: &Arc<Transaction>,
    policy: LockingPolicy,
    config: &IndexConfig,
    fetch_columns: Option<&[usize]>,
) -> Result<Option<Row>> {
    let width = btree.n_key_fields();
    if let Some(&c) = fetch_columns.into_iter().flatten().find(|&&c| c >= width) {
        return Err(ArborError::InvalidParameter {
            name: "fetch_columns".to_string(),
            value: format!("column {} out of range", c),
        });
    }

    let descending = btree.columns().first().map_or(false, |c| !c.ascending);
    let max = if descending {
        debug!(index = %btree.name(), "max scan on descending index uses forward scan");
        max_by_forward_scan(btree, txn, policy, config, true)?
    } else {
        let open = OpenBTree::open(Arc::clone(btree), Arc::clone(txn), policy, config, false)?;
        match max_from_rightmost_leaf(&open)? {
            Backward::Found(row, location) => {
                open.unlock_scan_row_after_read(location, false);
                Some(row)
            }
            Backward::FallBack => {
                debug!(index = %btree.name(), "max scan falling back to forward scan");
                max_by_forward_scan(btree, txn, policy, config, false)?
            }
        }
    };

    Ok(max.map(|row| match fetch_columns {
        None => row,
        Some(columns) => {
            let desc = FetchDescriptor::new(width, columns);
            row.into_iter()
                .enumerate()
                .map(|(i, v)| if desc.is_selected(i) { v } else { Value::Null })
                .collect()
        }
    }))
}

fn max_from_rightmost_leaf(open: &OpenBTree) -> Result<Backward> {
    let leaf = loop {
        let leaf = open.root()?.search_right(open)?;
        match open.lock_scan(leaf.page_num(), false)? {
            None => break leaf,
            Some(blocked) => {
                drop(leaf);
                open.wait_for(blocked)?;
            }
        }
    };

    let mut result = Backward::FallBack;
    for slot in (FIRST_ROW_SLOT..leaf.record_count()).rev() {
        if leaf.page().is_deleted_at_slot(slot)? {
            continue;
        }
        let row = leaf.row_at(slot)?;
        if row.first().map_or(true, Value::is_null) {
            continue;
        }
        if open.lock_scan_row(&leaf, slot, false)?.is_none() {
            let location = row_location_at(open, leaf.page(), slot)?;
            result = Backward::Found(row, location);
        }
        break;
    }

    let page_num = leaf.page_num();
    drop(leaf);
    open.unlock_scan(page_num);
    Ok(result)
}

fn max_by_forward_scan(
    btree: &Arc<BTree>,
    txn: &Arc<Transaction>,
    policy: LockingPolicy,
    config: &IndexConfig,
    descending: bool,
) -> Result<Option<Row>> {
    let scan = BTreeScan::open(Arc::clone(btree), txn, policy, config, ScanParams::default())?;
    let mut max = None;
    while let Some(row) = scan.fetch_next()? {
        if row.first().map_or(true, Value::is_null) {
            // NULLs lead a descending index and trail an ascending one
            if descending {
                continue;
            }
            break;
        }
        max = Some(row);
        if descending {
            break;
        }
    }
    scan.close();
    Ok(max)
}

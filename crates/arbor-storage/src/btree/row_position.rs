//! Where a scan stands between calls.
//!
//! A scan holds no latch between calls. While it keeps the scan lock of
//! its leaf, rows cannot move off that leaf, so the record id of the
//! current row is enough to find it again. When a structure change is
//! about to move rows, the scan copies the current row out as a key and
//! gives up the scan lock; the next call finds its place by searching for
//! that key from the root.

use arbor_common::{Row, RowLocation};

/// Page-local address of an index row. Slot 0 addresses the control row,
/// which stands for "before the first row of the page".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHandle {
    pub page_num: u32,
    pub record_id: u32,
}

#[derive(Debug, Default)]
pub(crate) struct RowPosition {
    /// Current slot while a call holds the leaf latched.
    pub slot: usize,
    /// Current record, valid while the scan holds the scan lock of its page.
    pub record: Option<RecordHandle>,
    /// Current row saved by key after the scan lock was given up.
    pub key: Option<Row>,
    /// Last row the scan read. Scans that take no scan locks search for it
    /// when their record has moved.
    pub last_row: Option<Row>,
    /// Leaf the scan holds its scan lock on.
    pub scan_page: Option<u32>,
    /// Base row locked for the current row.
    pub locked_row: Option<RowLocation>,
}

impl RowPosition {
    /// Positions on `slot` of a latched leaf.
    pub fn set_current(&mut self, page_num: u32, slot: usize, record_id: u32) {
        self.slot = slot;
        self.record = Some(RecordHandle { page_num, record_id });
        self.key = None;
    }

    /// Switches from the record handle to `key`.
    pub fn save_by_key(&mut self, key: Row) {
        self.key = Some(key);
        self.record = None;
    }

    /// Page of the current record, if positioned by handle.
    #[inline]
    pub fn page_num(&self) -> Option<u32> {
        self.record.map(|r| r.page_num)
    }

    /// Forgets the row. Locks are released by the caller.
    pub fn clear(&mut self) {
        *self = RowPosition::default();
    }
}

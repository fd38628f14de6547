//! Forward scans over an index.
//!
//! A scan is positioned lazily: the first fetch searches for the start key,
//! later fetches continue from the saved position. Between calls the scan
//! holds no latch, only a shared scan lock on its leaf (see
//! [`row_position`](super::row_position)).
//!
//! ```text
//!   Init ──fetch──> InProgress ──past stop key / end──> Done
//!    │                  │
//!    │ close_for_end_transaction(false) on a held scan
//!    v                  v
//!  HoldInit        HoldInProgress ──fetch──> InProgress (by saved key)
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use arbor_buffer::{FetchDescriptor, PageLatch};
use arbor_common::{ArborError, IndexConfig, Result, Row, RowLocation, Value};
use arbor_txn::{LockMode, LockWait, SavePosition, Transaction};

use super::conglomerate::BTree;
use super::constants::{CONTROL_SLOT, FIRST_ROW_SLOT};
use super::control_row::ControlRow;
use super::locking::{row_location_at, LockingPolicy};
use super::open::OpenBTree;
use super::post_commit::BTreePostCommit;
use super::qualifier::{row_qualifies, Qualifier};
use super::row_position::RowPosition;
use super::search::{compare_index_row_to_key, PartialKeyOrder, SearchParameters};

/// How a start or stop key bounds a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchOp {
    /// As a start bound, the first row >= the key. As a stop bound, the
    /// scan ends before the first row >= the key.
    #[default]
    Ge,
    /// As a start bound, the first row > the key. As a stop bound, the
    /// scan ends before the first row > the key.
    Gt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Not positioned yet.
    Init,
    InProgress,
    /// Past the last row.
    Done,
    /// A held scan closed for commit before positioning.
    HoldInit,
    /// A held scan closed for commit, positioned by saved key.
    HoldInProgress,
}

/// Counters accumulated over the life of a scan, reopens included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub pages_visited: u64,
    pub rows_visited: u64,
    pub rows_qualified: u64,
    pub deleted_rows_visited: u64,
}

/// Parameters of [`BTree::open_scan`].
#[derive(Debug, Clone, Default)]
pub struct ScanParams {
    /// Possibly partial key the scan starts at. None starts at the first row.
    pub start_key: Option<Row>,
    pub start_op: SearchOp,
    /// Possibly partial key the scan stops at. None runs to the last row.
    pub stop_key: Option<Row>,
    pub stop_op: SearchOp,
    /// Row filter in conjunctive normal form, see [`Qualifier`].
    pub qualifiers: Vec<Vec<Qualifier>>,
    /// Columns to return. Other columns come back as NULL.
    pub fetch_columns: Option<Vec<usize>>,
    /// Lock rows exclusively and allow [`BTreeScan::delete`].
    pub for_update: bool,
    /// Survive the end of the transaction, see
    /// [`BTreeScan::close_for_end_transaction`].
    pub hold: bool,
}

impl ScanParams {
    pub fn start(mut self, key: Row, op: SearchOp) -> Self {
        self.start_key = Some(key);
        self.start_op = op;
        self
    }

    pub fn stop(mut self, key: Row, op: SearchOp) -> Self {
        self.stop_key = Some(key);
        self.stop_op = op;
        self
    }

    pub fn with_qualifiers(mut self, qualifiers: Vec<Vec<Qualifier>>) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    pub fn with_columns(mut self, columns: Vec<usize>) -> Self {
        self.fetch_columns = Some(columns);
        self
    }

    pub fn updatable(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn held(mut self) -> Self {
        self.hold = true;
        self
    }

    fn check(&self, btree: &BTree) -> Result<()> {
        let width = btree.n_key_fields();
        let invalid = |name: &str, value: String| ArborError::InvalidParameter {
            name: name.to_string(),
            value,
        };
        for (name, key) in [("start_key", &self.start_key), ("stop_key", &self.stop_key)] {
            if let Some(key) = key {
                if key.len() > width {
                    return Err(invalid(name, format!("{} columns, index has {}", key.len(), width)));
                }
            }
        }
        if let Some(q) = self.qualifiers.iter().flatten().find(|q| q.column >= width) {
            return Err(invalid("qualifier", format!("column {} out of range", q.column)));
        }
        if let Some(&c) = self.fetch_columns.iter().flatten().find(|&&c| c >= width) {
            return Err(invalid("fetch_columns", format!("column {} out of range", c)));
        }
        Ok(())
    }
}

enum NextPage {
    /// Latched and scan locked the right sibling.
    Moved(ControlRow),
    /// Waited for the right sibling's scan lock and latched the current
    /// leaf again.
    Relatched(ControlRow),
    End,
}

/// An open scan.
///
/// Every call runs to completion with the scan's state locked; a scan is
/// driven by one thread at a time.
pub struct BTreeScan {
    inner: Mutex<ScanInner>,
}

struct ScanInner {
    open: OpenBTree,
    params: ScanParams,
    fetch_desc: Option<FetchDescriptor>,
    state: ScanState,
    pos: RowPosition,
    stats: ScanStats,
    closed: bool,
}

impl BTreeScan {
    /// Opens a scan and registers it with the transaction, so structure
    /// changes made by the same transaction can save its position.
    pub(crate) fn open(
        btree: Arc<BTree>,
        txn: &Arc<Transaction>,
        policy: LockingPolicy,
        config: &IndexConfig,
        params: ScanParams,
    ) -> Result<Arc<BTreeScan>> {
        params.check(&btree)?;
        let fetch_desc = params
            .fetch_columns
            .as_deref()
            .map(|columns| FetchDescriptor::new(btree.n_key_fields(), columns));
        let open = OpenBTree::open(btree, Arc::clone(txn), policy, config, params.for_update)?;
        debug!(
            index = %open.conglomerate().name(),
            txn = %txn.id(),
            ?policy,
            for_update = params.for_update,
            hold = params.hold,
            "scan opened"
        );

        let scan = Arc::new(BTreeScan {
            inner: Mutex::new(ScanInner {
                open,
                params,
                fetch_desc,
                state: ScanState::Init,
                pos: RowPosition::default(),
                stats: ScanStats::default(),
                closed: false,
            }),
        });
        let saver: Arc<dyn SavePosition> = Arc::clone(&scan) as Arc<dyn SavePosition>;
        txn.register_scan(Arc::downgrade(&saver));
        Ok(scan)
    }

    pub fn state(&self) -> ScanState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> ScanStats {
        self.inner.lock().stats
    }

    /// Rows are returned in key order.
    pub fn is_keyed(&self) -> bool {
        true
    }

    /// Moves to the next qualifying row. Returns false at the end.
    pub fn next(&self) -> Result<bool> {
        Ok(self.inner.lock().fetch_rows(1, |_| {})? == 1)
    }

    /// Moves to the next qualifying row and returns it.
    pub fn fetch_next(&self) -> Result<Option<Row>> {
        let mut fetched = None;
        self.inner.lock().fetch_rows(1, |row| fetched = Some(row))?;
        Ok(fetched)
    }

    /// Returns up to `max_rows` next qualifying rows. Fewer means the scan
    /// reached its end.
    pub fn fetch_next_group(&self, max_rows: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(max_rows.min(1024));
        self.inner
            .lock()
            .fetch_rows(max_rows as u64, |row| rows.push(row))?;
        Ok(rows)
    }

    /// Fetches up to `max_rows` rows, all of them if None, into a table
    /// keyed by `key_columns`. Rows sharing a key are kept in scan order.
    pub fn fetch_set(
        &self,
        max_rows: Option<u64>,
        key_columns: &[usize],
    ) -> Result<HashMap<Row, Vec<Row>>> {
        let mut set: HashMap<Row, Vec<Row>> = HashMap::new();
        self.inner
            .lock()
            .fetch_rows(max_rows.unwrap_or(u64::MAX), |row| {
                let key = key_columns
                    .iter()
                    .map(|&c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                set.entry(key).or_default().push(row);
            })?;
        Ok(set)
    }

    /// Returns the row the scan is positioned on, deleted or not.
    pub fn fetch(&self) -> Result<Row> {
        self.inner.lock().fetch_current()
    }

    /// True if the current row has been delete-marked since the scan
    /// moved onto it. False if the row is gone altogether.
    pub fn is_current_position_deleted(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_positioned()?;
        match inner.reposition(false)? {
            Some(leaf) => leaf.page().is_deleted_at_slot(inner.pos.slot),
            None => Ok(false),
        }
    }

    /// Index rows are never updated in place, so the current row still
    /// qualifies unless it was deleted.
    pub fn does_current_position_qualify(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_positioned()?;
        match inner.reposition(false)? {
            Some(leaf) => Ok(!leaf.page().is_deleted_at_slot(inner.pos.slot)?),
            None => Ok(false),
        }
    }

    /// Delete-marks the current row. Returns false if it already was.
    ///
    /// Deleting the last row of a leaf queues its reclamation to run after
    /// the transaction commits. A root leaf is left alone.
    pub fn delete(&self) -> Result<bool> {
        self.inner.lock().delete_current()
    }

    /// Not supported: index rows are deleted and reinserted instead.
    pub fn replace(&self, _row: &[Value]) -> Result<bool> {
        Err(ArborError::UnimplementedFeature("replace through an index scan"))
    }

    /// Not supported: the base row location is the last column of a
    /// fetched row.
    pub fn fetch_location(&self) -> Result<RowLocation> {
        Err(ArborError::UnimplementedFeature("fetch location of an index row"))
    }

    /// Restarts the scan with new bounds and qualifiers, keeping the
    /// columns, update mode, hold mode and statistics.
    pub fn reopen_scan(
        &self,
        start_key: Option<Row>,
        start_op: SearchOp,
        qualifiers: Vec<Vec<Qualifier>>,
        stop_key: Option<Row>,
        stop_op: SearchOp,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ArborError::ScanClosed);
        }
        let params = ScanParams {
            start_key,
            start_op,
            stop_key,
            stop_op,
            qualifiers,
            ..inner.params.clone()
        };
        params.check(inner.open.conglomerate())?;

        inner.leave_current_row();
        inner.release_scan_lock();
        inner.pos.clear();
        inner.params = params;
        inner.state = match inner.state {
            ScanState::HoldInit | ScanState::HoldInProgress => ScanState::HoldInit,
            _ => ScanState::Init,
        };
        Ok(())
    }

    /// Prepares the scan for the end of its transaction.
    ///
    /// A scan without hold, or any scan when `close_held_scan`, is closed
    /// and true is returned. A held scan saves its position by key and
    /// moves to a hold state, from which the next fetch after the commit
    /// resumes; false is returned.
    pub fn close_for_end_transaction(&self, close_held_scan: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(true);
        }
        if !inner.params.hold || close_held_scan {
            inner.close();
            return Ok(true);
        }
        match inner.state {
            ScanState::InProgress => {
                if inner.pos.key.is_none() {
                    inner.save_position_by_key()?;
                }
                // Released by the commit
                inner.pos.locked_row = None;
                inner.state = ScanState::HoldInProgress;
            }
            ScanState::Init => inner.state = ScanState::HoldInit,
            _ => {}
        }
        Ok(false)
    }

    /// Closes the scan, releasing its scan lock and, under read committed,
    /// its row lock.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.close();
        }
    }

    /// Leaf the scan stands on, while it is positioned by record rather
    /// than by saved key.
    pub fn current_page(&self) -> Option<u32> {
        self.inner.lock().pos.page_num()
    }
}

impl SavePosition for BTreeScan {
    fn save_position(&self, page: &PageLatch) -> Result<()> {
        self.inner.lock().save_position_on(page)
    }
}

impl Drop for BTreeScan {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.closed {
            inner.close();
        }
    }
}

impl std::fmt::Debug for BTreeScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("BTreeScan");
        match self.inner.try_lock() {
            Some(inner) => s
                .field("index", &inner.open.conglomerate().name())
                .field("state", &inner.state)
                .field("stats", &inner.stats)
                .finish(),
            None => s.finish_non_exhaustive(),
        }
    }
}

impl ScanInner {
    fn resume(&mut self) -> Result<()> {
        if self.closed {
            return Err(ArborError::ScanClosed);
        }
        if matches!(self.state, ScanState::HoldInit | ScanState::HoldInProgress) {
            // The commit released the table lock along with the rest
            self.open.lock_table(LockWait::Wait)?;
            self.state = match self.state {
                ScanState::HoldInit => ScanState::Init,
                _ => ScanState::InProgress,
            };
        }
        Ok(())
    }

    fn ensure_positioned(&mut self) -> Result<()> {
        self.resume()?;
        if self.state != ScanState::InProgress {
            return Err(ArborError::ScanNotPositioned);
        }
        Ok(())
    }

    fn record_not_found(&self) -> ArborError {
        let (page_num, record_id) = self
            .pos
            .record
            .map_or((0, 0), |r| (r.page_num, r.record_id));
        ArborError::RecordNotFound {
            container_id: self.open.container().id(),
            page_num,
            record_id,
        }
    }

    fn project(&self, row: Row) -> Row {
        match &self.fetch_desc {
            None => row,
            Some(desc) => row
                .into_iter()
                .enumerate()
                .map(|(i, v)| if desc.is_selected(i) { v } else { Value::Null })
                .collect(),
        }
    }

    /// Releases the row lock of the current row if the policy does not
    /// keep read locks.
    fn leave_current_row(&mut self) {
        if let Some(location) = self.pos.locked_row.take() {
            self.open
                .unlock_scan_row_after_read(location, self.params.for_update);
        }
    }

    fn release_scan_lock(&mut self) {
        if let Some(page) = self.pos.scan_page.take() {
            self.open.unlock_scan(page);
        }
    }

    fn position_at_done(&mut self) {
        self.leave_current_row();
        self.release_scan_lock();
        self.pos.clear();
        self.state = ScanState::Done;
    }

    fn close(&mut self) {
        self.position_at_done();
        self.closed = true;
        debug!(
            index = %self.open.conglomerate().name(),
            pages = self.stats.pages_visited,
            rows = self.stats.rows_visited,
            qualified = self.stats.rows_qualified,
            deleted = self.stats.deleted_rows_visited,
            "scan closed"
        );
    }

    /// Latches the leaf holding the first row to return and positions just
    /// before it. Locks the scan position and, under serializable
    /// isolation, the row before the start so no row can be inserted
    /// into the range.
    fn position_at_start(&mut self) -> Result<ControlRow> {
        let unique = self.open.conglomerate().is_unique();
        loop {
            let root = self.open.root()?;
            self.stats.pages_visited += u64::from(root.level()) + 1;

            let (leaf, slot, exact_unique) = match self.params.start_key.as_deref() {
                None => (root.search_left(&self.open)?, CONTROL_SLOT, false),
                Some(key) => {
                    let order = match self.params.start_op {
                        SearchOp::Ge => PartialKeyOrder::Left,
                        SearchOp::Gt => PartialKeyOrder::Right,
                    };
                    let mut sp = SearchParameters::new(key, order, false);
                    let leaf = root.search(&self.open, &mut sp)?;
                    if sp.result_exact && self.params.start_op == SearchOp::Ge {
                        // Step back so the first advance lands on the match
                        (leaf, sp.result_slot - 1, unique)
                    } else {
                        (leaf, sp.result_slot, false)
                    }
                }
            };

            // No other row can take the key of an exact unique match, so
            // the gap before it needs no lock
            if self.open.policy().locks_previous_key_on_scan() && !exact_unique {
                let mode = if self.params.for_update {
                    LockMode::Exclusive
                } else {
                    LockMode::Shared
                };
                if let Some(blocked) = self.open.lock_previous_row(&leaf, slot + 1, mode, false)? {
                    drop(leaf);
                    self.open.wait_for(blocked)?;
                    trace!(container = self.open.container().id(), "scan start retrying after previous key wait");
                    continue;
                }
            }
            if let Some(blocked) = self.open.lock_scan(leaf.page_num(), false)? {
                drop(leaf);
                self.open.wait_for(blocked)?;
                trace!(container = self.open.container().id(), "scan start retrying after scan lock wait");
                continue;
            }

            self.pos.scan_page = Some(leaf.page_num());
            let record_id = leaf.page().record_id_at_slot(slot)?;
            self.pos.set_current(leaf.page_num(), slot, record_id);
            self.pos.last_row = if slot >= FIRST_ROW_SLOT {
                Some(leaf.row_at(slot)?)
            } else {
                None
            };
            self.state = ScanState::InProgress;
            return Ok(leaf);
        }
    }

    /// Moves to the right sibling, scan locking it before giving up the
    /// current leaf.
    fn position_at_next_page(&mut self, leaf: ControlRow) -> Result<NextPage> {
        let Some(next) = leaf.right_sibling_page(&self.open)? else {
            return Ok(NextPage::End);
        };
        if let Some(blocked) = self.open.lock_scan(next.page_num(), false)? {
            // The current scan lock keeps the position valid while waiting
            drop(next);
            drop(leaf);
            self.open.wait_for(blocked)?;
            return match self.reposition(true)? {
                Some(current) => Ok(NextPage::Relatched(current)),
                None => Err(self.record_not_found()),
            };
        }

        self.stats.pages_visited += 1;
        self.leave_current_row();
        self.release_scan_lock();
        drop(leaf);

        self.pos.scan_page = Some(next.page_num());
        let record_id = next.page().record_id_at_slot(CONTROL_SLOT)?;
        self.pos.set_current(next.page_num(), CONTROL_SLOT, record_id);
        Ok(NextPage::Moved(next))
    }

    /// Latches the leaf of the current position.
    ///
    /// By record handle if the scan still stands on its record, otherwise
    /// by searching for the saved key and scan locking the leaf found. When
    /// the key is gone the scan lands just before where it was if
    /// `missing_ok`, and None is returned otherwise.
    fn reposition(&mut self, missing_ok: bool) -> Result<Option<ControlRow>> {
        if let Some(record) = self.pos.record {
            if let Some(leaf) = self.latch_record(record.page_num, record.record_id)? {
                return Ok(Some(leaf));
            }
            // Moved while the scan held no scan lock
            match self.pos.last_row.clone() {
                Some(row) => self.pos.save_by_key(row),
                None => return Ok(None),
            }
        }
        let Some(key) = self.pos.key.clone() else {
            return Ok(None);
        };

        self.release_scan_lock();
        loop {
            let mut sp = SearchParameters::new(&key, PartialKeyOrder::Left, false);
            let leaf = self.open.root()?.search(&self.open, &mut sp)?;
            if !sp.result_exact && !missing_ok {
                return Ok(None);
            }
            if let Some(blocked) = self.open.lock_scan(leaf.page_num(), false)? {
                drop(leaf);
                self.open.wait_for(blocked)?;
                trace!(container = self.open.container().id(), "scan reposition retrying after scan lock wait");
                continue;
            }
            self.pos.scan_page = Some(leaf.page_num());
            let record_id = leaf.page().record_id_at_slot(sp.result_slot)?;
            self.pos.set_current(leaf.page_num(), sp.result_slot, record_id);
            return Ok(Some(leaf));
        }
    }

    fn latch_record(&mut self, page_num: u32, record_id: u32) -> Result<Option<ControlRow>> {
        let leaf = match ControlRow::get(&self.open, page_num) {
            Ok(leaf) => leaf,
            Err(ArborError::PageNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !leaf.is_leaf() {
            return Ok(None);
        }
        match leaf.page().slot_of_record_id(record_id) {
            Some(slot) => {
                self.pos.slot = slot;
                Ok(Some(leaf))
            }
            None => Ok(None),
        }
    }

    fn past_stop_key(&self, row: &[Value]) -> bool {
        let Some(stop) = self.params.stop_key.as_deref() else {
            return false;
        };
        let columns = self.open.conglomerate().columns();
        let mut ord = compare_index_row_to_key(row, stop, row.len(), Ordering::Equal, columns);
        if ord == Ordering::Equal && self.params.stop_op == SearchOp::Ge {
            ord = Ordering::Greater;
        }
        ord == Ordering::Greater
    }

    /// Advances over up to `max_rows` qualifying rows, handing each to
    /// `emit`. Returns the number emitted; fewer than `max_rows` means the
    /// scan is done.
    fn fetch_rows<F>(&mut self, max_rows: u64, mut emit: F) -> Result<u64>
    where
        F: FnMut(Row),
    {
        self.resume()?;
        if max_rows == 0 {
            return Ok(0);
        }
        let mut leaf = match self.state {
            ScanState::Init => self.position_at_start()?,
            ScanState::InProgress => match self.reposition(true)? {
                Some(leaf) => leaf,
                None => return Err(self.record_not_found()),
            },
            _ => return Ok(0),
        };

        let mut fetched = 0;
        let mut advance = true;
        loop {
            if advance {
                self.leave_current_row();
                self.pos.slot += 1;
            }
            advance = true;

            if self.pos.slot >= leaf.record_count() {
                match self.position_at_next_page(leaf)? {
                    NextPage::Moved(next) | NextPage::Relatched(next) => leaf = next,
                    NextPage::End => {
                        self.position_at_done();
                        return Ok(fetched);
                    }
                }
                continue;
            }

            let slot = self.pos.slot;
            let row = leaf.row_at(slot)?;
            let record_id = leaf.page().record_id_at_slot(slot)?;
            self.pos.set_current(leaf.page_num(), slot, record_id);
            self.pos.last_row = Some(row.clone());

            if self.past_stop_key(&row) {
                drop(leaf);
                self.position_at_done();
                return Ok(fetched);
            }

            let location = row_location_at(&self.open, leaf.page(), slot)?;
            if self.pos.locked_row != Some(location) {
                // A lock left from before a wait, if the row changed since
                self.leave_current_row();
                if let Some(blocked) = self.open.lock_scan_row(&leaf, slot, self.params.for_update)? {
                    drop(leaf);
                    self.open.wait_for(blocked)?;
                    self.pos.locked_row = Some(location);
                    // The scan lock kept the row on its page; look at it again
                    leaf = match self.reposition(true)? {
                        Some(leaf) => leaf,
                        None => return Err(self.record_not_found()),
                    };
                    advance = false;
                    continue;
                }
                self.pos.locked_row = Some(location);
            }
            self.stats.rows_visited += 1;

            let qualifies = if leaf.page().is_deleted_at_slot(slot)? {
                self.stats.deleted_rows_visited += 1;
                false
            } else {
                row_qualifies(&self.params.qualifiers, &row)
            };
            if !qualifies {
                continue;
            }

            self.stats.rows_qualified += 1;
            fetched += 1;
            emit(self.project(row));
            if fetched >= max_rows {
                return Ok(fetched);
            }
        }
    }

    fn fetch_current(&mut self) -> Result<Row> {
        self.ensure_positioned()?;
        let leaf = match self.reposition(false)? {
            Some(leaf) => leaf,
            None => return Err(self.record_not_found()),
        };
        let row = leaf.row_at(self.pos.slot)?;
        drop(leaf);
        Ok(self.project(row))
    }

    fn delete_current(&mut self) -> Result<bool> {
        self.ensure_positioned()?;
        if !self.params.for_update {
            return Err(ArborError::InvalidParameter {
                name: "scan".to_string(),
                value: "not opened for update".to_string(),
            });
        }
        loop {
            let mut leaf = match self.reposition(false)? {
                Some(leaf) => leaf,
                None => return Err(self.record_not_found()),
            };
            let slot = self.pos.slot;

            // Positions restored after a commit hold no row lock
            let location = row_location_at(&self.open, leaf.page(), slot)?;
            if self.pos.locked_row != Some(location) {
                if let Some(blocked) = self.open.lock_scan_row(&leaf, slot, true)? {
                    drop(leaf);
                    self.open.wait_for(blocked)?;
                    self.pos.locked_row = Some(location);
                    continue;
                }
                self.pos.locked_row = Some(location);
            }

            if leaf.page().is_deleted_at_slot(slot)? {
                return Ok(false);
            }
            leaf.page_mut().delete_at_slot(self.open.log(), slot, true)?;
            trace!(
                container = self.open.container().id(),
                page = leaf.page_num(),
                slot,
                "index row deleted"
            );

            // Only the control row is left
            if leaf.page().non_deleted_record_count() == 1
                && !(leaf.is_root() && leaf.is_leaf())
            {
                let work = BTreePostCommit::new(Arc::clone(self.open.conglomerate()), leaf.page_num());
                self.open.txn().add_post_commit_work(Box::new(work));
            }
            return Ok(true);
        }
    }

    /// Copies the current row out as the position key and gives up the
    /// scan lock.
    fn save_position_by_key(&mut self) -> Result<()> {
        match self.reposition(false)? {
            Some(leaf) => {
                let key = leaf.row_at(self.pos.slot)?;
                drop(leaf);
                self.pos.save_by_key(key);
            }
            None => {
                if let Some(row) = self.pos.last_row.clone() {
                    self.pos.save_by_key(row);
                }
            }
        }
        self.release_scan_lock();
        Ok(())
    }

    /// Saves the position by key if the scan stands on a row of `page`,
    /// which the caller holds latched.
    fn save_position_on(&mut self, page: &PageLatch) -> Result<()> {
        if self.closed
            || self.state != ScanState::InProgress
            || page.container().id() != self.open.container().id()
        {
            return Ok(());
        }
        let Some(record) = self.pos.record else {
            return Ok(());
        };
        if record.page_num != page.page_num() {
            return Ok(());
        }
        let key = match page.slot_of_record_id(record.record_id) {
            Some(slot) if slot >= FIRST_ROW_SLOT => page.fetch_from_slot(slot, None)?,
            _ => match self.pos.last_row.clone() {
                Some(row) => row,
                None => return Ok(()),
            },
        };
        self.pos.save_by_key(key);
        self.release_scan_lock();
        trace!(
            container = page.container().id(),
            page = page.page_num(),
            "scan position saved by key"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::conglomerate::CreateIndex;
    use crate::btree::qualifier::CompareOp;
    use crate::btree::test_support::{int_row, TestIndex};
    use arbor_common::TypeId;
    use arbor_txn::LockKey;
    use std::time::Duration;

    fn config(max_rows: Option<usize>) -> IndexConfig {
        IndexConfig {
            max_rows_per_page: max_rows,
            check_consistency: false,
        }
    }

    /// Index over keys `1..=n`, inserted in reverse with four rows a page,
    /// and committed.
    fn filled(n: i64) -> TestIndex {
        let index = TestIndex::new(CreateIndex::new("s", 1, &[TypeId::Int64]));
        let mut cc = index
            .btree
            .open_controller(&index.txn, LockingPolicy::RowSerializable, &config(Some(4)))
            .unwrap();
        for k in (1..=n).rev() {
            cc.insert(&int_row(k)).unwrap();
        }
        index.txn.commit_and_continue().unwrap();
        index
    }

    fn open(index: &TestIndex, policy: LockingPolicy, params: ScanParams) -> Arc<BTreeScan> {
        index
            .btree
            .open_scan(&index.txn, policy, &config(Some(4)), params)
            .unwrap()
    }

    fn drain(scan: &BTreeScan) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Some(row) = scan.fetch_next().unwrap() {
            keys.push(row[0].as_i64().unwrap());
        }
        keys
    }

    fn key(k: i64) -> Row {
        vec![Value::Int64(k)]
    }

    #[test]
    fn test_full_scan_crosses_leaves_in_order() {
        let index = filled(40);
        assert!(index.btree.height(&index.txn).unwrap() > 1);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(scan.state(), ScanState::Init);
        assert_eq!(drain(&scan), (1..=40).collect::<Vec<_>>());
        assert_eq!(scan.state(), ScanState::Done);

        let stats = scan.stats();
        assert_eq!(stats.rows_qualified, 40);
        assert_eq!(stats.rows_visited, 40);
        assert!(stats.pages_visited > 10);
        assert!(!scan.next().unwrap());
    }

    #[test]
    fn test_start_and_stop_operators() {
        let index = filled(20);
        let cases = [
            (SearchOp::Ge, SearchOp::Gt, 5..=9),
            (SearchOp::Gt, SearchOp::Gt, 6..=9),
            (SearchOp::Ge, SearchOp::Ge, 5..=8),
            (SearchOp::Gt, SearchOp::Ge, 6..=8),
        ];
        for (start_op, stop_op, expected) in cases {
            let params = ScanParams::default()
                .start(key(5), start_op)
                .stop(key(9), stop_op);
            let scan = open(&index, LockingPolicy::RowSerializable, params);
            assert_eq!(drain(&scan), expected.collect::<Vec<_>>(), "{:?} {:?}", start_op, stop_op);
            scan.close();
        }
    }

    #[test]
    fn test_start_beyond_last_row_is_empty() {
        let index = filled(10);
        let params = ScanParams::default().start(key(11), SearchOp::Ge);
        let scan = open(&index, LockingPolicy::RowSerializable, params);
        assert_eq!(scan.fetch_next().unwrap(), None);
    }

    #[test]
    fn test_qualifiers_and_projection() {
        let index = filled(30);
        let odd_or_big = vec![
            vec![Qualifier::new(0, CompareOp::Ge, Value::Int64(10))],
            vec![
                Qualifier::new(0, CompareOp::Le, Value::Int64(12)),
                Qualifier::new(0, CompareOp::Gt, Value::Int64(27)),
            ],
        ];
        let params = ScanParams::default()
            .with_qualifiers(odd_or_big)
            .with_columns(vec![0]);
        let scan = open(&index, LockingPolicy::RowSerializable, params);
        let rows = scan.fetch_next_group(100).unwrap();
        let keys: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(keys, vec![10, 11, 12, 28, 29, 30]);
        assert!(rows.iter().all(|r| r[1] == Value::Null));
        assert_eq!(scan.stats().rows_visited, 30);
    }

    #[test]
    fn test_fetch_set_groups_by_key_columns() {
        let index = TestIndex::new(CreateIndex::new("g", 1, &[TypeId::Int64, TypeId::Int64]));
        let mut cc = index
            .btree
            .open_controller(&index.txn, LockingPolicy::Table, &config(Some(4)))
            .unwrap();
        for i in 0..12i64 {
            let row = vec![
                Value::Int64(i % 3),
                Value::Int64(i),
                Value::RowLocation(RowLocation::new(1, i as u32)),
            ];
            cc.insert(&row).unwrap();
        }
        let scan = open(&index, LockingPolicy::Table, ScanParams::default());
        let set = scan.fetch_set(None, &[0]).unwrap();
        assert_eq!(set.len(), 3);
        let group = &set[&vec![Value::Int64(1)]];
        let seconds: Vec<i64> = group.iter().map(|r| r[1].as_i64().unwrap()).collect();
        assert_eq!(seconds, vec![1, 4, 7, 10]);
    }

    #[test]
    fn test_fetch_next_group_resumes() {
        let index = filled(25);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(scan.fetch_next_group(10).unwrap().len(), 10);
        assert_eq!(scan.fetch().unwrap(), int_row(10));
        assert_eq!(scan.fetch_next_group(10).unwrap().len(), 10);
        assert_eq!(scan.fetch_next_group(10).unwrap().len(), 5);
        assert_eq!(scan.state(), ScanState::Done);
    }

    #[test]
    fn test_delete_through_scan() {
        let index = filled(12);
        let params = ScanParams::default()
            .start(key(5), SearchOp::Ge)
            .stop(key(5), SearchOp::Gt)
            .updatable();
        let scan = open(&index, LockingPolicy::RowSerializable, params);
        assert_eq!(scan.fetch_next().unwrap(), Some(int_row(5)));
        assert!(!scan.is_current_position_deleted().unwrap());
        assert!(scan.delete().unwrap());
        assert!(!scan.delete().unwrap());
        assert!(scan.is_current_position_deleted().unwrap());
        assert!(!scan.does_current_position_qualify().unwrap());
        // Fetching the current row still works on a deleted row
        assert_eq!(scan.fetch().unwrap(), int_row(5));
        assert_eq!(scan.fetch_next().unwrap(), None);
        scan.close();

        let rest = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        let keys = drain(&rest);
        assert_eq!(keys.len(), 11);
        assert!(!keys.contains(&5));
        assert_eq!(rest.stats().deleted_rows_visited, 1);
    }

    #[test]
    fn test_deleting_a_leaf_queues_reclaim() {
        let index = filled(12);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default().updatable());
        while scan.next().unwrap() {
            assert!(scan.delete().unwrap());
        }
        scan.close();
        index.txn.commit_and_continue().unwrap();
        assert!(index.mgr.pending_post_commit_work() > 0);

        index.mgr.run_post_commit_work();
        assert_eq!(index.btree.level_row_counts(&index.txn).unwrap()[0], 0);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_root_leaf_delete_queues_nothing() {
        let index = filled(3);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default().updatable());
        while scan.next().unwrap() {
            scan.delete().unwrap();
        }
        scan.close();
        index.txn.commit_and_continue().unwrap();
        assert_eq!(index.mgr.pending_post_commit_work(), 0);
    }

    #[test]
    fn test_delete_requires_update_scan() {
        let index = filled(3);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert!(scan.next().unwrap());
        assert!(matches!(scan.delete(), Err(ArborError::InvalidParameter { .. })));
    }

    #[test]
    fn test_unpositioned_and_closed_scans() {
        let index = filled(3);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert!(matches!(scan.fetch(), Err(ArborError::ScanNotPositioned)));
        assert!(matches!(
            scan.is_current_position_deleted(),
            Err(ArborError::ScanNotPositioned)
        ));
        assert!(matches!(scan.replace(&int_row(1)), Err(ArborError::UnimplementedFeature(_))));
        assert!(matches!(scan.fetch_location(), Err(ArborError::UnimplementedFeature(_))));
        scan.close();
        assert!(matches!(scan.fetch_next(), Err(ArborError::ScanClosed)));
    }

    #[test]
    fn test_held_scan_survives_commit() {
        let index = filled(20);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default().held());
        assert_eq!(scan.fetch_next_group(7).unwrap().len(), 7);

        assert!(!scan.close_for_end_transaction(false).unwrap());
        assert_eq!(scan.state(), ScanState::HoldInProgress);
        index.txn.commit_and_continue().unwrap();

        assert_eq!(drain(&scan), (8..=20).collect::<Vec<_>>());
        assert!(scan.close_for_end_transaction(true).unwrap());
        assert!(matches!(scan.next(), Err(ArborError::ScanClosed)));
    }

    #[test]
    fn test_unheld_scan_closes_at_end_of_transaction() {
        let index = filled(5);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert!(scan.next().unwrap());
        assert!(scan.close_for_end_transaction(false).unwrap());
        assert!(matches!(scan.next(), Err(ArborError::ScanClosed)));
    }

    #[test]
    fn test_reopen_scan_keeps_statistics() {
        let index = filled(10);
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(drain(&scan).len(), 10);
        scan.reopen_scan(Some(key(8)), SearchOp::Ge, Vec::new(), None, SearchOp::Ge)
            .unwrap();
        assert_eq!(scan.state(), ScanState::Init);
        assert_eq!(drain(&scan), vec![8, 9, 10]);
        assert_eq!(scan.stats().rows_qualified, 13);
    }

    #[test]
    fn test_split_in_same_transaction_saves_position() {
        let index = TestIndex::new(CreateIndex::new("p", 1, &[TypeId::Int64]));
        let mut cc = index
            .btree
            .open_controller(&index.txn, LockingPolicy::RowSerializable, &config(Some(4)))
            .unwrap();
        for k in 1..=10 {
            cc.insert(&int_row(k * 10)).unwrap();
        }
        index.txn.commit_and_continue().unwrap();

        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(scan.fetch_next().unwrap(), Some(int_row(10)));
        assert!(scan.current_page().is_some());

        // Every insert lands on the scan's leaf, which must split
        for k in 11..=19 {
            cc.insert(&int_row(k)).unwrap();
        }
        assert_eq!(scan.current_page(), None);

        let expected: Vec<i64> = (11..=19).chain((2..=10).map(|k| k * 10)).collect();
        assert_eq!(drain(&scan), expected);
        index.btree.check_consistency(&index.txn).unwrap();
    }

    #[test]
    fn test_read_committed_releases_row_locks_when_moving_on() {
        let index = filled(5);
        let scan = open(&index, LockingPolicy::RowReadCommitted, ScanParams::default());
        let locks = index.mgr.lock_manager();
        let row_key = |k: u32| LockKey::Row {
            container_id: 1,
            location: RowLocation::new(1, k),
        };

        assert!(scan.next().unwrap());
        assert!(locks.is_held(index.txn.owner(), &row_key(1), LockMode::Shared));
        assert!(scan.next().unwrap());
        assert!(!locks.is_held(index.txn.owner(), &row_key(1), LockMode::Shared));
        assert!(locks.is_held(index.txn.owner(), &row_key(2), LockMode::Shared));
        scan.close();
        assert!(!locks.is_held(index.txn.owner(), &row_key(2), LockMode::Shared));
    }

    #[test]
    fn test_serializable_scan_waits_for_row_lock() {
        let index = filled(6);
        let writer = index.mgr.begin();
        let row_key = LockKey::Row {
            container_id: 1,
            location: RowLocation::new(1, 4),
        };
        assert!(writer.lock(row_key, LockMode::Exclusive, LockWait::NoWait).unwrap());

        let releaser = {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                writer.commit().unwrap();
            })
        };
        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(drain(&scan), (1..=6).collect::<Vec<_>>());
        releaser.join().unwrap();
    }

    #[test]
    fn test_scan_lock_conflict_times_out() {
        let index = filled(6);
        let writer = index.mgr.begin();
        let row_key = LockKey::Row {
            container_id: 1,
            location: RowLocation::new(1, 2),
        };
        assert!(writer.lock(row_key, LockMode::Exclusive, LockWait::NoWait).unwrap());

        let scan = open(&index, LockingPolicy::RowSerializable, ScanParams::default());
        assert_eq!(scan.fetch_next().unwrap(), Some(int_row(1)));
        let err = scan.fetch_next().unwrap_err();
        assert!(err.is_lock_error());
        writer.commit().unwrap();
    }

    #[test]
    fn test_open_rejects_bad_columns() {
        let index = filled(1);
        let params = ScanParams::default().with_columns(vec![5]);
        let err = index
            .btree
            .open_scan(&index.txn, LockingPolicy::RowSerializable, &config(None), params)
            .unwrap_err();
        assert!(matches!(err, ArborError::InvalidParameter { .. }));
    }
}

//! Page containers.
//!
//! A container is an in-memory set of slotted record pages numbered from
//! `FIRST_PAGE_NUM`. Pages are reached through exclusive latches; every
//! change made through a latch is recorded in the caller's undo log so the
//! owning transaction can roll it back.
//!
//! Freed pages and the forwarding addresses of moved records stay around
//! only while some transaction could still undo a change logged against
//! them. Each is stamped when it is created, and each transaction with
//! undo records against the container is stamped at its first change.
//! When a transaction ends, everything stamped before the oldest remaining
//! writer is released: forwarding entries are dropped and freed frames
//! leave memory, their page numbers going back to `add_page`.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use arbor_common::page::{PageId, FIRST_PAGE_NUM, MIN_PAGE_SIZE, PAGE_SIZE};
use arbor_common::value::{column_count, read_column, read_row, read_row_columns, serialize_row};
use arbor_common::{ArborError, Result, Row, Value};
use arbor_wal::{LogRecord, LogRecordType, PagePayload, UndoLog, FLAG_WAS_DELETED};

use crate::disk::DiskManager;
use crate::frame::{FrameGuard, FrameState, PageFrame};
use crate::page::{FetchDescriptor, RecordPage, RECORD_FLAG_DELETED, RECORD_FLAGS_SIZE, SLOT_ARRAY_START, SLOT_SIZE};

/// An in-memory page container.
pub struct Container {
    id: u32,
    page_size: usize,
    frames: RwLock<BTreeMap<u32, Arc<PageFrame>>>,
    next_page_num: AtomicU32,
    /// Live (not freed) pages.
    page_count: AtomicI64,
    /// Records on live pages, delete-marked ones included.
    row_count: AtomicI64,
    /// Source of the stamps kept in `book`.
    clock: AtomicU64,
    /// Lock order: `book` before `frames`.
    book: Mutex<PageBook>,
}

#[derive(Default)]
struct PageBook {
    /// Stamp of the first change of each transaction whose undo records
    /// may still touch this container, keyed by transaction id.
    writers: HashMap<u32, u64>,
    /// Freed pages whose frames are kept for undo, with the stamp of the free.
    freed: BTreeMap<u32, u64>,
    /// Where records moved by `copy_and_purge` went, keyed by
    /// (page, record id). Undo follows these when a record is no longer on
    /// the page it was logged against.
    forwards: HashMap<(u32, u32), Forward>,
    /// Page numbers `add_page` hands out before fresh ones.
    free_list: BTreeSet<u32>,
    /// Released pages whose image on disk is still the last one written.
    stale_on_disk: BTreeSet<u32>,
}

#[derive(Clone, Copy)]
struct Forward {
    to: (u32, u32),
    stamp: u64,
}

impl PageBook {
    /// Stamp below which nothing can be referenced by pending undo.
    fn horizon(&self) -> u64 {
        self.writers.values().copied().min().unwrap_or(u64::MAX)
    }

    fn release_page(&mut self, page_num: u32) {
        self.free_list.insert(page_num);
        self.stale_on_disk.insert(page_num);
    }
}

impl Container {
    /// Creates an empty container.
    pub fn new(id: u32, page_size: usize) -> Result<Arc<Self>> {
        if !(MIN_PAGE_SIZE..=PAGE_SIZE).contains(&page_size) {
            return Err(ArborError::InvalidParameter {
                name: "page_size".to_string(),
                value: page_size.to_string(),
            });
        }
        Ok(Arc::new(Self {
            id,
            page_size,
            frames: RwLock::new(BTreeMap::new()),
            next_page_num: AtomicU32::new(FIRST_PAGE_NUM),
            page_count: AtomicI64::new(0),
            row_count: AtomicI64::new(0),
            clock: AtomicU64::new(1),
            book: Mutex::new(PageBook::default()),
        }))
    }

    /// Returns the container id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the logical page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns true if these rows would fit together on a fresh page.
    pub fn rows_fit_on_empty_page(&self, rows: &[&[Value]]) -> bool {
        let needed: usize = rows
            .iter()
            .map(|row| RECORD_FLAGS_SIZE + arbor_common::value::row_size(row) + SLOT_SIZE)
            .sum();
        SLOT_ARRAY_START + needed <= self.page_size
    }

    fn frame(&self, page_num: u32) -> Option<Arc<PageFrame>> {
        self.frames.read().get(&page_num).cloned()
    }

    /// Returns the numbers of the live pages.
    pub fn page_numbers(&self) -> Vec<u32> {
        let book = self.book.lock();
        self.frames
            .read()
            .keys()
            .copied()
            .filter(|p| !book.freed.contains_key(p))
            .collect()
    }

    /// Returns true if `page_num` is a live page.
    pub fn contains_page(&self, page_num: u32) -> bool {
        let book = self.book.lock();
        !book.freed.contains_key(&page_num) && self.frames.read().contains_key(&page_num)
    }

    /// Returns the number of freed page numbers waiting to be reused.
    pub fn free_page_count(&self) -> usize {
        self.book.lock().free_list.len()
    }

    /// Returns the number of forwarding addresses kept for undo.
    pub fn forward_count(&self) -> usize {
        self.book.lock().forwards.len()
    }

    /// Latches a page, waiting for other holders. Returns None if the page
    /// does not exist or has been freed.
    pub fn get_page(self: &Arc<Self>, page_num: u32) -> Option<PageLatch> {
        let frame = self.frame(page_num)?;
        let guard = frame.latch();
        self.wrap(page_num, guard)
    }

    /// Latches a page only if it is immediately available.
    pub fn get_page_no_wait(self: &Arc<Self>, page_num: u32) -> Option<PageLatch> {
        let frame = self.frame(page_num)?;
        let guard = frame.try_latch()?;
        self.wrap(page_num, guard)
    }

    fn wrap(self: &Arc<Self>, page_num: u32, guard: FrameGuard) -> Option<PageLatch> {
        if guard.is_freed() {
            return None;
        }
        Some(PageLatch {
            container: Arc::clone(self),
            page_num,
            guard,
        })
    }

    /// Allocates an empty page and returns it latched. Released page
    /// numbers are reused, lowest first.
    pub fn add_page(self: &Arc<Self>, log: &UndoLog) -> Result<PageLatch> {
        let (page_num, guard) = {
            let mut book = self.book.lock();
            let page_num = match book.free_list.pop_first() {
                Some(page_num) => {
                    book.stale_on_disk.remove(&page_num);
                    page_num
                }
                None => self.next_page_num.fetch_add(1, Ordering::SeqCst),
            };
            let frame = Arc::new(PageFrame::new(
                PageId::new(self.id, page_num),
                self.page_size,
            ));
            let guard = frame.latch();
            self.frames.write().insert(page_num, frame);
            (page_num, guard)
        };
        self.page_count.fetch_add(1, Ordering::Relaxed);

        let mut latch = PageLatch {
            container: Arc::clone(self),
            page_num,
            guard,
        };
        latch.log_change(
            log,
            LogRecordType::AllocPage,
            0,
            PagePayload::page(self.id, page_num),
        );
        debug!(container = self.id, page = page_num, "page allocated");
        Ok(latch)
    }

    /// Frees a latched page. The frame is kept until no transaction can
    /// undo the free, then its page number becomes reusable.
    pub fn remove_page(&self, mut latch: PageLatch, log: &UndoLog) -> Result<()> {
        let page_num = latch.page_num;
        let image = Bytes::copy_from_slice(&latch.guard.data[..self.page_size]);
        let records = RecordPage::slot_count(latch.data());

        latch.log_change(
            log,
            LogRecordType::FreePage,
            0,
            PagePayload::page(self.id, page_num).with_before_image(image),
        );
        let data = &mut latch.guard.data[..];
        let mut header = RecordPage::page_header(data);
        header.flags.set_freed(true);
        RecordPage::set_page_header(data, &header);
        latch.guard.aux = None;
        let stamp = self.clock.fetch_add(1, Ordering::SeqCst);
        self.book.lock().freed.insert(page_num, stamp);

        self.page_count.fetch_sub(1, Ordering::Relaxed);
        self.row_count.fetch_sub(records as i64, Ordering::Relaxed);
        debug!(container = self.id, page = page_num, "page freed");
        Ok(())
    }

    /// Returns the number of live pages.
    pub fn estimated_page_count(&self) -> u64 {
        self.page_count.load(Ordering::Relaxed).max(0) as u64
    }

    /// Returns the number of records on live pages.
    pub fn estimated_row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed).max(0) as u64
    }

    /// Marks `txn_id` as holding undo records against this container.
    fn note_writer(&self, txn_id: u32) {
        let mut book = self.book.lock();
        if !book.writers.contains_key(&txn_id) {
            let stamp = self.clock.fetch_add(1, Ordering::SeqCst);
            book.writers.insert(txn_id, stamp);
        }
    }

    /// Called when a transaction commits, aborts or commits and continues:
    /// its undo records are gone. Releases the freed pages and forwarding
    /// addresses no remaining writer can need.
    pub fn end_unit(&self, txn_id: u32) {
        let mut book = self.book.lock();
        if book.writers.remove(&txn_id).is_none() {
            return;
        }
        let horizon = book.horizon();
        let forwards_before = book.forwards.len();
        book.forwards.retain(|_, f| f.stamp >= horizon);

        let released: Vec<u32> = book
            .freed
            .iter()
            .filter(|(_, &stamp)| stamp < horizon)
            .map(|(&page_num, _)| page_num)
            .collect();
        if !released.is_empty() {
            let mut frames = self.frames.write();
            for page_num in &released {
                book.freed.remove(page_num);
                frames.remove(page_num);
                book.release_page(*page_num);
            }
        }

        let dropped = forwards_before - book.forwards.len();
        if dropped > 0 || !released.is_empty() {
            debug!(
                container = self.id,
                txn = txn_id,
                pages = released.len(),
                forwards = dropped,
                "freed space released"
            );
        }
    }

    /// Latches the page currently holding a record, following forwarding
    /// addresses left by record moves.
    fn latch_record(&self, page_num: u32, record_id: u32) -> Result<(FrameGuard, usize)> {
        let not_found = || ArborError::RecordNotFound {
            container_id: self.id,
            page_num,
            record_id,
        };
        let (mut page, mut record) = (page_num, record_id);
        // A chain can revisit a location when rows move back to a page
        let mut hops = self.book.lock().forwards.len();
        loop {
            if let Some(frame) = self.frame(page) {
                let guard = frame.latch();
                if let Some(slot) = RecordPage::find_record_id(guard.data(), record) {
                    return Ok((guard, slot));
                }
            }
            if hops == 0 {
                return Err(not_found());
            }
            hops -= 1;
            match self.book.lock().forwards.get(&(page, record)) {
                Some(forward) => (page, record) = forward.to,
                None => return Err(not_found()),
            }
        }
    }

    /// Reverses one logged change. The caller must hold no latches in this
    /// container.
    pub fn undo(&self, record: &LogRecord) -> Result<()> {
        let payload = PagePayload::deserialize(&record.payload)?;
        if payload.container_id != self.id {
            return Err(ArborError::ContainerNotFound {
                container_id: payload.container_id,
            });
        }

        let missing_image = || ArborError::WalCorrupted {
            lsn: record.lsn.0,
            reason: format!("{:?} record without before image", record.record_type),
        };

        let mut guard = match record.record_type {
            LogRecordType::InsertSlot => {
                let (mut guard, slot) = self.latch_record(payload.page_num, payload.record_id)?;
                RecordPage::remove_record(&mut guard.data[..], slot)?;
                self.row_count.fetch_sub(1, Ordering::Relaxed);
                guard
            }
            LogRecordType::UpdateField => {
                let image = payload.before_image.as_ref().ok_or_else(missing_image)?;
                let (mut guard, slot) = self.latch_record(payload.page_num, payload.record_id)?;
                RecordPage::replace_record(&mut guard.data[..], slot, image)?;
                guard
            }
            LogRecordType::DeleteMark => {
                let (mut guard, slot) = self.latch_record(payload.page_num, payload.record_id)?;
                RecordPage::set_deleted(
                    &mut guard.data[..],
                    slot,
                    record.has_flag(FLAG_WAS_DELETED),
                )?;
                guard
            }
            LogRecordType::PurgeSlot => {
                let image = payload.before_image.as_ref().ok_or_else(missing_image)?;
                let frame = self.frame(payload.page_num).ok_or(ArborError::PageNotFound {
                    container_id: self.id,
                    page_num: payload.page_num,
                })?;
                let mut guard = frame.latch();
                RecordPage::insert_record(
                    &mut guard.data[..],
                    payload.slot as usize,
                    image,
                    Some(payload.record_id),
                )?;
                self.row_count.fetch_add(1, Ordering::Relaxed);
                guard
            }
            LogRecordType::AllocPage => {
                let mut book = self.book.lock();
                if self.frames.write().remove(&payload.page_num).is_some() {
                    book.release_page(payload.page_num);
                    self.page_count.fetch_sub(1, Ordering::Relaxed);
                }
                return Ok(());
            }
            LogRecordType::FreePage => {
                let image = payload.before_image.as_ref().ok_or_else(missing_image)?;
                let frame = self.frame(payload.page_num).ok_or(ArborError::PageNotFound {
                    container_id: self.id,
                    page_num: payload.page_num,
                })?;
                let mut guard = frame.latch();
                guard.data[..image.len()].copy_from_slice(image);
                self.book.lock().freed.remove(&payload.page_num);
                self.page_count.fetch_add(1, Ordering::Relaxed);
                self.row_count.fetch_add(
                    RecordPage::slot_count(guard.data()) as i64,
                    Ordering::Relaxed,
                );
                guard
            }
        };

        guard.aux = None;
        guard.dirty = true;
        Ok(())
    }

    /// Reverses a sequence of changes, given newest first.
    pub fn rollback(&self, records: &[LogRecord]) -> Result<usize> {
        for record in records {
            self.undo(record)?;
        }
        debug!(container = self.id, records = records.len(), "changes rolled back");
        Ok(records.len())
    }

    /// Writes every dirty page to disk and blanks the disk image of every
    /// released page. Returns the number of pages written.
    pub fn checkpoint(&self, disk: &DiskManager) -> Result<usize> {
        let stale = std::mem::take(&mut self.book.lock().stale_on_disk);
        let blank = Box::new([0u8; PAGE_SIZE]);
        for &page_num in &stale {
            disk.write_page(PageId::new(self.id, page_num), &blank)?;
        }

        let frames: Vec<Arc<PageFrame>> = self.frames.read().values().cloned().collect();
        let mut written = 0;

        for frame in frames {
            let mut guard = frame.latch();
            if !guard.dirty {
                continue;
            }
            let checksum = RecordPage::compute_checksum(guard.data());
            let mut header = RecordPage::page_header(guard.data());
            header.checksum = checksum;
            RecordPage::set_page_header(&mut guard.data[..], &header);

            disk.write_page(frame.page_id(), &guard.data)?;
            guard.dirty = false;
            written += 1;
        }

        disk.sync(self.id)?;
        info!(
            container = self.id,
            pages = written,
            released = stale.len(),
            "container checkpointed"
        );
        Ok(written)
    }

    /// Loads a container written by `checkpoint`, verifying page checksums.
    pub fn open(id: u32, disk: &DiskManager) -> Result<Arc<Self>> {
        if !disk.container_exists(id) {
            return Err(ArborError::ContainerNotFound { container_id: id });
        }
        let num_pages = disk.num_pages(id)?;

        let mut frames = BTreeMap::new();
        let mut book = PageBook::default();
        let mut page_size = None;
        let mut live_pages = 0i64;
        let mut rows = 0i64;

        for page_num in FIRST_PAGE_NUM..num_pages {
            let page_id = PageId::new(id, page_num);
            let data = disk.read_page(page_id)?;
            // Released and rolled-back pages leave holes
            if data.iter().all(|&b| b == 0) {
                book.free_list.insert(page_num);
                continue;
            }

            let header = RecordPage::page_header(&data[..]);
            let computed = RecordPage::compute_checksum(&data[..]);
            if header.checksum != computed {
                warn!(container = id, page = page_num, "page checksum mismatch");
                return Err(ArborError::PageCorrupted {
                    page_num,
                    reason: format!(
                        "checksum mismatch: stored {:#010x}, computed {:#010x}",
                        header.checksum, computed
                    ),
                });
            }
            if header.page_id != page_id {
                return Err(ArborError::PageCorrupted {
                    page_num,
                    reason: format!("page header names {}", header.page_id),
                });
            }

            page_size.get_or_insert(header.logical_size());
            // No transaction can undo a free from before the reopen
            if header.flags.is_freed() {
                book.free_list.insert(page_num);
                continue;
            }
            live_pages += 1;
            rows += RecordPage::slot_count(&data[..]) as i64;
            frames.insert(page_num, Arc::new(PageFrame::from_image(page_id, data, false)));
        }

        info!(
            container = id,
            pages = live_pages,
            rows,
            free = book.free_list.len(),
            "container opened"
        );
        Ok(Arc::new(Self {
            id,
            page_size: page_size.unwrap_or(PAGE_SIZE),
            frames: RwLock::new(frames),
            next_page_num: AtomicU32::new(num_pages.max(FIRST_PAGE_NUM)),
            page_count: AtomicI64::new(live_pages),
            row_count: AtomicI64::new(rows),
            clock: AtomicU64::new(1),
            book: Mutex::new(book),
        }))
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("pages", &self.estimated_page_count())
            .field("rows", &self.estimated_row_count())
            .finish()
    }
}

/// An exclusive latch on one container page.
///
/// Dropping the latch releases it.
pub struct PageLatch {
    container: Arc<Container>,
    page_num: u32,
    guard: FrameGuard,
}

impl PageLatch {
    /// Returns the page number.
    #[inline]
    pub fn page_num(&self) -> u32 {
        self.page_num
    }

    /// Returns the full page id.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId::new(self.container.id, self.page_num)
    }

    /// Returns the container the page belongs to.
    #[inline]
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.guard.data[..]
    }

    #[inline]
    fn state(&mut self) -> &mut FrameState {
        &mut self.guard
    }

    fn log_change(
        &mut self,
        log: &UndoLog,
        record_type: LogRecordType,
        flags: u8,
        payload: PagePayload,
    ) {
        self.container.note_writer(log.txn_id());
        let lsn = log.append(record_type, flags, &payload);
        let state = self.state();
        RecordPage::stamp_lsn(&mut state.data[..], lsn.0);
        state.dirty = true;
    }

    /// Returns the LSN of the last change applied to the page.
    pub fn page_lsn(&self) -> u64 {
        RecordPage::page_header(self.data()).lsn
    }

    /// Returns the number of records on the page, delete-marked ones included.
    pub fn record_count(&self) -> usize {
        RecordPage::slot_count(self.data())
    }

    /// Returns the number of records without a delete mark.
    pub fn non_deleted_record_count(&self) -> usize {
        RecordPage::non_deleted_count(self.data())
    }

    /// Returns true if the record at `slot` is delete-marked.
    pub fn is_deleted_at_slot(&self, slot: usize) -> Result<bool> {
        RecordPage::is_deleted(self.data(), slot)
    }

    /// Returns the record id at `slot`.
    pub fn record_id_at_slot(&self, slot: usize) -> Result<u32> {
        Ok(RecordPage::slot(self.data(), slot)?.record_id)
    }

    /// Returns the slot holding `record_id`, if it is on this page.
    pub fn slot_of_record_id(&self, record_id: u32) -> Option<usize> {
        RecordPage::find_record_id(self.data(), record_id)
    }

    /// Returns the reclaimable free space in bytes.
    pub fn free_space(&self) -> usize {
        RecordPage::free_space(self.data())
    }

    /// Returns true if `row` would fit on the page.
    pub fn space_for_insert(&self, row: &[Value]) -> bool {
        let len = RECORD_FLAGS_SIZE + arbor_common::value::row_size(row);
        RecordPage::has_space_for(self.data(), len)
    }

    /// Materializes the row at `slot`. With a descriptor, unselected
    /// columns come back as NULL.
    pub fn fetch_from_slot(&self, slot: usize, desc: Option<&FetchDescriptor>) -> Result<Row> {
        let bytes = RecordPage::row_bytes(self.data(), slot)?;
        match desc {
            Some(desc) => read_row_columns(bytes, desc.columns()),
            None => read_row(bytes),
        }
    }

    /// Reads a single column of the row at `slot`.
    pub fn fetch_field_from_slot(&self, slot: usize, column: usize) -> Result<Value> {
        read_column(RecordPage::row_bytes(self.data(), slot)?, column)
    }

    /// Returns the number of columns in the row at `slot`.
    pub fn fetch_num_fields_at_slot(&self, slot: usize) -> Result<usize> {
        column_count(RecordPage::row_bytes(self.data(), slot)?)
    }

    /// Inserts a row at `slot`, shifting later rows right.
    ///
    /// Returns the new record id, or None if the page lacks space.
    pub fn insert_at_slot(
        &mut self,
        log: &UndoLog,
        slot: usize,
        row: &[Value],
        deleted: bool,
    ) -> Result<Option<u32>> {
        let row_bytes = serialize_row(row);
        let mut record = Vec::with_capacity(RECORD_FLAGS_SIZE + row_bytes.len());
        record.push(if deleted { RECORD_FLAG_DELETED } else { 0 });
        record.extend_from_slice(&row_bytes);

        if !RecordPage::has_space_for(self.data(), record.len()) {
            return Ok(None);
        }
        let record_id = match RecordPage::insert_record(&mut self.guard.data[..], slot, &record, None) {
            Ok(id) => id,
            Err(ArborError::PageFull) => return Ok(None),
            Err(e) => return Err(e),
        };

        let payload = PagePayload::slot(self.container.id, self.page_num, slot, record_id);
        self.log_change(log, LogRecordType::InsertSlot, 0, payload);
        self.container.row_count.fetch_add(1, Ordering::Relaxed);
        Ok(Some(record_id))
    }

    /// Overwrites one column of the row at `slot`.
    ///
    /// Returns false, leaving the row unchanged, if the new value does not fit.
    pub fn update_field_at_slot(
        &mut self,
        log: &UndoLog,
        slot: usize,
        column: usize,
        value: &Value,
    ) -> Result<bool> {
        let before = Bytes::copy_from_slice(RecordPage::record(self.data(), slot)?);
        let mut row = read_row(&before[RECORD_FLAGS_SIZE..])?;
        let field = row.get_mut(column).ok_or_else(|| ArborError::InvalidParameter {
            name: "column".to_string(),
            value: column.to_string(),
        })?;
        *field = value.clone();

        let row_bytes = serialize_row(&row);
        let mut record = Vec::with_capacity(RECORD_FLAGS_SIZE + row_bytes.len());
        record.push(before[0]);
        record.extend_from_slice(&row_bytes);

        match RecordPage::replace_record(&mut self.guard.data[..], slot, &record) {
            Ok(()) => {}
            Err(ArborError::PageFull) => return Ok(false),
            Err(e) => return Err(e),
        }

        let record_id = self.record_id_at_slot(slot)?;
        let payload = PagePayload::slot(self.container.id, self.page_num, slot, record_id)
            .with_column(column)
            .with_before_image(before);
        self.log_change(log, LogRecordType::UpdateField, 0, payload);
        Ok(true)
    }

    /// Replaces the whole row at `slot`, keeping its delete mark and record
    /// id. Returns false if the new row does not fit.
    pub fn update_at_slot(&mut self, log: &UndoLog, slot: usize, row: &[Value]) -> Result<bool> {
        let before = Bytes::copy_from_slice(RecordPage::record(self.data(), slot)?);
        let row_bytes = serialize_row(row);
        let mut record = Vec::with_capacity(RECORD_FLAGS_SIZE + row_bytes.len());
        record.push(before[0]);
        record.extend_from_slice(&row_bytes);

        match RecordPage::replace_record(&mut self.guard.data[..], slot, &record) {
            Ok(()) => {}
            Err(ArborError::PageFull) => return Ok(false),
            Err(e) => return Err(e),
        }

        let record_id = self.record_id_at_slot(slot)?;
        let payload = PagePayload::slot(self.container.id, self.page_num, slot, record_id)
            .with_before_image(before);
        self.log_change(log, LogRecordType::UpdateField, 0, payload);
        Ok(true)
    }

    /// Sets or clears the delete mark of the row at `slot`.
    pub fn delete_at_slot(&mut self, log: &UndoLog, slot: usize, delete: bool) -> Result<()> {
        let was_deleted = RecordPage::set_deleted(&mut self.guard.data[..], slot, delete)?;
        let record_id = self.record_id_at_slot(slot)?;
        let flags = if was_deleted { FLAG_WAS_DELETED } else { 0 };
        let payload = PagePayload::slot(self.container.id, self.page_num, slot, record_id);
        self.log_change(log, LogRecordType::DeleteMark, flags, payload);
        Ok(())
    }

    /// Physically removes `num_rows` rows starting at `slot`.
    pub fn purge_at_slot(&mut self, log: &UndoLog, slot: usize, num_rows: usize) -> Result<()> {
        for _ in 0..num_rows {
            let entry = RecordPage::slot(self.data(), slot)?;
            let image = Bytes::copy_from_slice(RecordPage::record(self.data(), slot)?);
            RecordPage::remove_record(&mut self.guard.data[..], slot)?;

            let payload = PagePayload::slot(self.container.id, self.page_num, slot, entry.record_id)
                .with_before_image(image);
            self.log_change(log, LogRecordType::PurgeSlot, 0, payload);
            self.container.row_count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Moves `num_rows` rows starting at `src_slot` to `dest` starting at
    /// `dest_slot`, keeping their delete marks.
    ///
    /// Fails with `PageFull`, leaving both pages unchanged, if `dest`
    /// cannot take every row.
    pub fn copy_and_purge(
        &mut self,
        log: &UndoLog,
        dest: &mut PageLatch,
        src_slot: usize,
        num_rows: usize,
        dest_slot: usize,
    ) -> Result<()> {
        let mut needed = 0;
        for i in 0..num_rows {
            needed += RecordPage::record(self.data(), src_slot + i)?.len()
                + crate::page::SLOT_SIZE;
        }
        if needed > dest.free_space() {
            return Err(ArborError::PageFull);
        }

        let stamp = self.container.clock.fetch_add(1, Ordering::SeqCst);
        let mut moved = Vec::with_capacity(num_rows);
        for i in 0..num_rows {
            let entry = RecordPage::slot(self.data(), src_slot + i)?;
            let record = RecordPage::record(self.data(), src_slot + i)?.to_vec();
            let keep_id = dest.slot_of_record_id(entry.record_id).is_none();
            let new_id = RecordPage::insert_record(
                &mut dest.guard.data[..],
                dest_slot + i,
                &record,
                keep_id.then_some(entry.record_id),
            )?;

            let payload =
                PagePayload::slot(dest.container.id, dest.page_num, dest_slot + i, new_id);
            dest.log_change(log, LogRecordType::InsertSlot, 0, payload);
            self.container.row_count.fetch_add(1, Ordering::Relaxed);
            let forward = Forward {
                to: (dest.page_num, new_id),
                stamp,
            };
            moved.push(((self.page_num, entry.record_id), forward));
        }

        self.purge_at_slot(log, src_slot, num_rows)?;
        self.container.book.lock().forwards.extend(moved);
        Ok(())
    }

    /// Returns the cached per-page object if it has type `T`.
    pub fn aux<T: Any>(&self) -> Option<&T> {
        self.guard.aux.as_ref()?.downcast_ref::<T>()
    }

    /// Returns the cached per-page object mutably if it has type `T`.
    pub fn aux_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.guard.aux.as_mut()?.downcast_mut::<T>()
    }

    /// Replaces the cached per-page object.
    pub fn set_aux<T: Any + Send>(&mut self, value: T) {
        self.guard.aux = Some(Box::new(value));
    }

    /// Drops the cached per-page object.
    pub fn invalidate_aux(&mut self) {
        self.guard.aux = None;
    }
}

impl std::fmt::Debug for PageLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLatch")
            .field("page_id", &self.page_id())
            .field("records", &self.record_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::ContainerConfig;
    use tempfile::tempdir;

    fn row(k: i64) -> Row {
        vec![Value::Int64(k), Value::Varchar(format!("v{}", k))]
    }

    fn keys(latch: &PageLatch) -> Vec<i64> {
        (0..latch.record_count())
            .map(|s| latch.fetch_field_from_slot(s, 0).unwrap().as_i64().unwrap())
            .collect()
    }

    fn rollback(container: &Container, log: &UndoLog) {
        container.rollback(&log.take_for_undo().unwrap()).unwrap();
    }

    #[test]
    fn test_add_and_get_page() {
        let container = Container::new(1, 4096).unwrap();
        let log = UndoLog::new(1);
        let page = container.add_page(&log).unwrap();
        assert_eq!(page.page_num(), FIRST_PAGE_NUM);
        assert_eq!(page.page_id(), PageId::new(1, 1));
        assert!(container.get_page_no_wait(1).is_none());
        drop(page);

        assert!(container.get_page(1).is_some());
        assert!(container.get_page(2).is_none());
        assert_eq!(container.estimated_page_count(), 1);
    }

    #[test]
    fn test_insert_fetch_and_counts() {
        let container = Container::new(1, 4096).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();

        page.insert_at_slot(&log, 0, &row(20), false).unwrap().unwrap();
        page.insert_at_slot(&log, 0, &row(10), false).unwrap().unwrap();
        page.insert_at_slot(&log, 2, &row(30), true).unwrap().unwrap();

        assert_eq!(keys(&page), vec![10, 20, 30]);
        assert_eq!(page.record_count(), 3);
        assert_eq!(page.non_deleted_record_count(), 2);
        assert!(page.is_deleted_at_slot(2).unwrap());
        assert_eq!(page.fetch_num_fields_at_slot(0).unwrap(), 2);

        let desc = FetchDescriptor::new(2, &[1]);
        let fetched = page.fetch_from_slot(1, Some(&desc)).unwrap();
        assert_eq!(fetched, vec![Value::Null, Value::Varchar("v20".into())]);
        assert_eq!(container.estimated_row_count(), 3);
    }

    #[test]
    fn test_insert_without_space_returns_none() {
        let container = Container::new(1, MIN_PAGE_SIZE).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();
        let big = vec![Value::Varbinary(vec![0u8; MIN_PAGE_SIZE])];
        assert!(!page.space_for_insert(&big));
        assert_eq!(page.insert_at_slot(&log, 0, &big, false).unwrap(), None);
        assert_eq!(page.record_count(), 0);
    }

    #[test]
    fn test_update_at_slot_replaces_row() {
        let container = Container::new(1, 4096).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();
        page.insert_at_slot(&log, 0, &row(10), true).unwrap();
        let rid = page.record_id_at_slot(0).unwrap();
        log.truncate();

        let wider = vec![Value::Int64(11), Value::Null, Value::Int32(7)];
        assert!(page.update_at_slot(&log, 0, &wider).unwrap());
        assert_eq!(page.fetch_from_slot(0, None).unwrap(), wider);
        assert_eq!(page.record_id_at_slot(0).unwrap(), rid);
        assert!(page.is_deleted_at_slot(0).unwrap());

        let huge = vec![Value::Varbinary(vec![1u8; 8192])];
        assert!(!page.update_at_slot(&log, 0, &huge).unwrap());
        drop(page);

        rollback(&container, &log);
        let page = container.get_page(1).unwrap();
        assert_eq!(page.fetch_from_slot(0, None).unwrap(), row(10));
    }

    #[test]
    fn test_rollback_restores_rows() {
        let container = Container::new(1, 4096).unwrap();
        let setup = UndoLog::new(1);
        let mut page = container.add_page(&setup).unwrap();
        for (i, k) in [10, 20, 30].iter().enumerate() {
            page.insert_at_slot(&setup, i, &row(*k), false).unwrap();
        }
        setup.truncate();

        let log = UndoLog::new(2);
        page.insert_at_slot(&log, 1, &row(15), false).unwrap();
        page.delete_at_slot(&log, 3, true).unwrap();
        page.update_field_at_slot(&log, 0, 1, &Value::Varchar("changed".into()))
            .unwrap();
        page.purge_at_slot(&log, 2, 1).unwrap();
        assert_eq!(keys(&page), vec![10, 15, 30]);
        drop(page);

        rollback(&container, &log);
        let page = container.get_page(1).unwrap();
        assert_eq!(keys(&page), vec![10, 20, 30]);
        assert_eq!(page.non_deleted_record_count(), 3);
        assert_eq!(
            page.fetch_field_from_slot(0, 1).unwrap(),
            Value::Varchar("v10".into())
        );
        assert_eq!(container.estimated_row_count(), 3);
    }

    #[test]
    fn test_copy_and_purge_and_undo_through_forwarding() {
        let container = Container::new(1, 4096).unwrap();
        let user = UndoLog::new(1);
        let mut left = container.add_page(&user).unwrap();
        for (i, k) in [1, 2, 3, 4].iter().enumerate() {
            left.insert_at_slot(&user, i, &row(*k), false).unwrap();
        }

        // A separate log moves the upper half to a new page and is kept
        let split = UndoLog::new(2);
        let mut right = container.add_page(&split).unwrap();
        left.copy_and_purge(&split, &mut right, 2, 2, 0).unwrap();
        assert_eq!(keys(&left), vec![1, 2]);
        assert_eq!(keys(&right), vec![3, 4]);
        split.truncate();
        drop(left);
        drop(right);

        // Undoing the original inserts finds rows 3 and 4 on their new page
        rollback(&container, &user);
        assert!(container.get_page(1).is_none());
        let right = container.get_page(2).unwrap();
        assert_eq!(right.record_count(), 0);
    }

    #[test]
    fn test_remove_page_and_undo() {
        let container = Container::new(1, 4096).unwrap();
        let setup = UndoLog::new(1);
        let page = container.add_page(&setup).unwrap();
        drop(page);
        setup.truncate();

        let log = UndoLog::new(2);
        let page = container.get_page(1).unwrap();
        container.remove_page(page, &log).unwrap();
        assert!(container.get_page(1).is_none());
        assert_eq!(container.estimated_page_count(), 0);

        rollback(&container, &log);
        assert!(container.get_page(1).is_some());
        assert_eq!(container.estimated_page_count(), 1);
    }

    #[test]
    fn test_freed_page_released_after_last_writer_ends() {
        let container = Container::new(1, 4096).unwrap();
        let setup = UndoLog::new(1);
        drop(container.add_page(&setup).unwrap());
        drop(container.add_page(&setup).unwrap());
        setup.truncate();
        container.end_unit(1);

        // An older writer keeps the freed frame around for its undo
        let older = UndoLog::new(2);
        let mut page = container.get_page(1).unwrap();
        page.insert_at_slot(&older, 0, &row(1), false).unwrap();
        drop(page);

        let freeing = UndoLog::new(3);
        let page = container.get_page(2).unwrap();
        container.remove_page(page, &freeing).unwrap();
        freeing.truncate();
        container.end_unit(3);
        assert_eq!(container.page_numbers(), vec![1]);
        assert!(!container.contains_page(2));
        assert_eq!(container.free_page_count(), 0);

        older.truncate();
        container.end_unit(2);
        assert_eq!(container.free_page_count(), 1);

        let log = UndoLog::new(4);
        let reused = container.add_page(&log).unwrap();
        assert_eq!(reused.page_num(), 2);
        assert_eq!(reused.record_count(), 0);
        assert_eq!(container.free_page_count(), 0);
        assert_eq!(container.estimated_page_count(), 2);
    }

    #[test]
    fn test_rolled_back_allocation_is_reused() {
        let container = Container::new(1, 4096).unwrap();
        let log = UndoLog::new(1);
        drop(container.add_page(&log).unwrap());
        rollback(&container, &log);
        container.end_unit(1);
        assert_eq!(container.free_page_count(), 1);
        assert_eq!(container.add_page(&log).unwrap().page_num(), FIRST_PAGE_NUM);
    }

    #[test]
    fn test_forwarding_addresses_dropped_after_commit() {
        let container = Container::new(1, 4096).unwrap();
        let setup = UndoLog::new(1);
        drop(container.add_page(&setup).unwrap());
        drop(container.add_page(&setup).unwrap());
        setup.truncate();
        container.end_unit(1);

        // A long-running writer keeps every later forwarding address
        let long = UndoLog::new(2);
        let mut page = container.get_page(1).unwrap();
        page.insert_at_slot(&long, 0, &row(0), false).unwrap();
        drop(page);

        for i in 0..1000u32 {
            let txn_id = 10 + i;
            let log = UndoLog::new(txn_id);
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            let mut src = container.get_page(from).unwrap();
            let mut dest = container.get_page(to).unwrap();
            src.insert_at_slot(&log, 0, &row(i as i64), false).unwrap();
            src.copy_and_purge(&log, &mut dest, 0, 1, 0).unwrap();
            dest.purge_at_slot(&log, 0, 1).unwrap();
            drop(src);
            drop(dest);
            log.truncate();
            container.end_unit(txn_id);
        }
        assert_eq!(container.forward_count(), 1000);

        long.truncate();
        container.end_unit(2);
        assert_eq!(container.forward_count(), 0);
    }

    #[test]
    fn test_forwarding_cycle_ends_in_record_not_found() {
        let container = Container::new(1, 4096).unwrap();
        let setup = UndoLog::new(1);
        drop(container.add_page(&setup).unwrap());
        drop(container.add_page(&setup).unwrap());
        setup.truncate();

        let user = UndoLog::new(2);
        let mut first = container.get_page(1).unwrap();
        first.insert_at_slot(&user, 0, &row(7), false).unwrap();

        // Out and back again, then gone
        let mover = UndoLog::new(3);
        let mut second = container.get_page(2).unwrap();
        first.copy_and_purge(&mover, &mut second, 0, 1, 0).unwrap();
        second.copy_and_purge(&mover, &mut first, 0, 1, 0).unwrap();
        first.purge_at_slot(&mover, 0, 1).unwrap();
        drop(first);
        drop(second);
        mover.truncate();
        assert_eq!(container.forward_count(), 2);

        let records = user.take_for_undo().unwrap();
        assert!(matches!(
            container.rollback(&records),
            Err(ArborError::RecordNotFound { page_num: 1, .. })
        ));
    }

    #[test]
    fn test_aux_is_dropped_by_undo() {
        let container = Container::new(1, 4096).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();
        page.set_aux(7u64);
        assert_eq!(page.aux::<u64>(), Some(&7));
        assert_eq!(page.aux::<u32>(), None);
        *page.aux_mut::<u64>().unwrap() = 8;
        page.insert_at_slot(&log, 0, &row(1), false).unwrap();
        drop(page);

        let record = log.take_for_undo().unwrap().remove(0);
        container.undo(&record).unwrap();
        assert!(container.get_page(1).unwrap().aux::<u64>().is_none());
    }

    #[test]
    fn test_checkpoint_and_open() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        })
        .unwrap();

        let container = Container::new(9, 4096).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();
        page.insert_at_slot(&log, 0, &row(5), false).unwrap();
        page.insert_at_slot(&log, 1, &row(6), true).unwrap();
        drop(page);

        assert_eq!(container.checkpoint(&disk).unwrap(), 1);
        assert_eq!(container.checkpoint(&disk).unwrap(), 0);

        let reopened = Container::open(9, &disk).unwrap();
        assert_eq!(reopened.page_size(), 4096);
        assert_eq!(reopened.estimated_row_count(), 2);
        let page = reopened.get_page(1).unwrap();
        assert_eq!(keys(&page), vec![5, 6]);
        assert!(page.is_deleted_at_slot(1).unwrap());
    }

    #[test]
    fn test_checkpoint_blanks_released_pages() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        })
        .unwrap();

        let container = Container::new(4, 4096).unwrap();
        let setup = UndoLog::new(1);
        for k in 1..=3 {
            let mut page = container.add_page(&setup).unwrap();
            page.insert_at_slot(&setup, 0, &row(k), false).unwrap();
        }
        setup.truncate();
        container.end_unit(1);
        assert_eq!(container.checkpoint(&disk).unwrap(), 3);

        let log = UndoLog::new(2);
        let page = container.get_page(2).unwrap();
        container.remove_page(page, &log).unwrap();
        log.truncate();
        container.end_unit(2);
        assert_eq!(container.free_page_count(), 1);
        container.checkpoint(&disk).unwrap();

        let reopened = Container::open(4, &disk).unwrap();
        assert_eq!(reopened.page_numbers(), vec![1, 3]);
        assert_eq!(reopened.estimated_page_count(), 2);
        assert_eq!(reopened.estimated_row_count(), 2);
        assert_eq!(reopened.free_page_count(), 1);
        assert_eq!(reopened.add_page(&UndoLog::new(1)).unwrap().page_num(), 2);
        assert_eq!(reopened.add_page(&UndoLog::new(1)).unwrap().page_num(), 4);
    }

    #[test]
    fn test_open_detects_corruption() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        })
        .unwrap();

        let container = Container::new(3, 4096).unwrap();
        let log = UndoLog::new(1);
        let mut page = container.add_page(&log).unwrap();
        page.insert_at_slot(&log, 0, &row(1), false).unwrap();
        drop(page);
        container.checkpoint(&disk).unwrap();

        let mut image = disk.read_page(PageId::new(3, 1)).unwrap();
        image[4000] ^= 0xFF;
        disk.write_page(PageId::new(3, 1), &image).unwrap();

        assert!(matches!(
            Container::open(3, &disk),
            Err(ArborError::PageCorrupted { page_num: 1, .. })
        ));
    }

    #[test]
    fn test_open_missing_container() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            Container::open(42, &disk),
            Err(ArborError::ContainerNotFound { container_id: 42 })
        ));
    }

    #[test]
    fn test_invalid_page_size() {
        assert!(Container::new(1, 100).is_err());
        assert!(Container::new(1, PAGE_SIZE * 2).is_err());
    }
}

//! Slotted record page.
//!
//! Page layout:
//! ```text
//! +--------------------+ 0
//! | Page Header (32)   |
//! +--------------------+ 32
//! | Record Header (16) |
//! +--------------------+ 48
//! | Slot Array         |  <- grows toward the end, kept in key order
//! | (8 bytes/slot)     |
//! +--------------------+
//! |                    |
//! | Free Space         |
//! |                    |
//! +--------------------+
//! | Record Data        |  <- grows toward the start
//! +--------------------+ page_size
//! ```
//!
//! Each record is a one-byte flag header followed by a serialized row.
//! Inserting at slot `i` shifts slots `i..` one position right, so slot
//! numbers are positional while record ids stay fixed for the life of a
//! record.

use arbor_common::page::{PageHeader, PageId, PageType};
use arbor_common::{ArborError, Result};

/// Offset of the record header in a page (after PageHeader).
pub const RECORD_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Size of the record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Offset where the slot array begins.
pub const SLOT_ARRAY_START: usize = RECORD_HEADER_OFFSET + RECORD_HEADER_SIZE;

/// Size of one slot entry in bytes.
pub const SLOT_SIZE: usize = 8;

/// Size of the per-record flag header.
pub const RECORD_FLAGS_SIZE: usize = 1;

/// Record flag: the record is marked deleted but still physically present.
pub const RECORD_FLAG_DELETED: u8 = 0b0000_0001;

/// One entry of the slot array.
///
/// Layout (8 bytes):
/// - offset: 2 bytes (offset from page start to the record)
/// - length: 2 bytes (record length including the flag byte)
/// - record_id: 4 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSlot {
    pub offset: u16,
    pub length: u16,
    pub record_id: u32,
}

impl RecordSlot {
    /// Serializes the slot to bytes.
    pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..2].copy_from_slice(&self.offset.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_id.to_le_bytes());
        buf
    }

    /// Deserializes a slot from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            offset: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            record_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Record page header extension, stored after the PageHeader.
///
/// Layout (16 bytes):
/// - slot_count: 2 bytes
/// - free_space_start: 2 bytes (end of slot array)
/// - free_space_end: 2 bytes (start of record data)
/// - used_bytes: 2 bytes (sum of live record lengths)
/// - next_record_id: 4 bytes
/// - reserved: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPageHeader {
    pub slot_count: u16,
    pub free_space_start: u16,
    pub free_space_end: u16,
    pub used_bytes: u16,
    pub next_record_id: u32,
}

impl RecordPageHeader {
    /// Creates the header of an empty page.
    pub fn new(page_size: usize) -> Self {
        Self {
            slot_count: 0,
            free_space_start: SLOT_ARRAY_START as u16,
            free_space_end: page_size as u16,
            used_bytes: 0,
            next_record_id: 1,
        }
    }

    /// Returns the contiguous free space between slot array and record data.
    pub fn contiguous_free(&self) -> usize {
        (self.free_space_end as usize).saturating_sub(self.free_space_start as usize)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free_space_start.to_le_bytes());
        buf[4..6].copy_from_slice(&self.free_space_end.to_le_bytes());
        buf[6..8].copy_from_slice(&self.used_bytes.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next_record_id.to_le_bytes());
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            free_space_start: u16::from_le_bytes([buf[2], buf[3]]),
            free_space_end: u16::from_le_bytes([buf[4], buf[5]]),
            used_bytes: u16::from_le_bytes([buf[6], buf[7]]),
            next_record_id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// Static in-slice operations over a record page buffer.
pub struct RecordPage;

impl RecordPage {
    /// Formats an empty record page.
    pub fn init(data: &mut [u8], page_id: PageId, page_size: usize) {
        data.fill(0);
        let page_header = PageHeader::new(page_id, PageType::Record, page_size);
        data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
        Self::set_header(data, RecordPageHeader::new(page_size));
    }

    /// Reads the common page header.
    #[inline]
    pub fn page_header(data: &[u8]) -> PageHeader {
        PageHeader::from_bytes(&data[..PageHeader::SIZE])
    }

    /// Writes the common page header.
    #[inline]
    pub fn set_page_header(data: &mut [u8], header: &PageHeader) {
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Reads the record header.
    #[inline]
    pub fn header(data: &[u8]) -> RecordPageHeader {
        RecordPageHeader::from_bytes(
            &data[RECORD_HEADER_OFFSET..RECORD_HEADER_OFFSET + RECORD_HEADER_SIZE],
        )
    }

    #[inline]
    fn set_header(data: &mut [u8], header: RecordPageHeader) {
        data[RECORD_HEADER_OFFSET..RECORD_HEADER_OFFSET + RECORD_HEADER_SIZE]
            .copy_from_slice(&header.to_bytes());
        let mut page_header = Self::page_header(data);
        page_header.record_count = header.slot_count;
        Self::set_page_header(data, &page_header);
    }

    /// Returns the number of records on the page.
    #[inline]
    pub fn slot_count(data: &[u8]) -> usize {
        Self::header(data).slot_count as usize
    }

    fn check_slot(data: &[u8], slot: usize) -> Result<()> {
        let count = Self::slot_count(data);
        if slot >= count {
            return Err(ArborError::SlotOutOfRange {
                page_num: Self::page_header(data).page_id.page_num,
                slot,
                count,
            });
        }
        Ok(())
    }

    #[inline]
    fn slot_unchecked(data: &[u8], slot: usize) -> RecordSlot {
        let offset = SLOT_ARRAY_START + slot * SLOT_SIZE;
        RecordSlot::from_bytes(&data[offset..offset + SLOT_SIZE])
    }

    #[inline]
    fn set_slot(data: &mut [u8], slot: usize, entry: RecordSlot) {
        let offset = SLOT_ARRAY_START + slot * SLOT_SIZE;
        data[offset..offset + SLOT_SIZE].copy_from_slice(&entry.to_bytes());
    }

    /// Reads a slot entry.
    pub fn slot(data: &[u8], slot: usize) -> Result<RecordSlot> {
        Self::check_slot(data, slot)?;
        Ok(Self::slot_unchecked(data, slot))
    }

    /// Returns the full record (flag byte plus row bytes).
    pub fn record(data: &[u8], slot: usize) -> Result<&[u8]> {
        let entry = Self::slot(data, slot)?;
        let start = entry.offset as usize;
        Ok(&data[start..start + entry.length as usize])
    }

    /// Returns the serialized row stored at a slot.
    pub fn row_bytes(data: &[u8], slot: usize) -> Result<&[u8]> {
        Ok(&Self::record(data, slot)?[RECORD_FLAGS_SIZE..])
    }

    /// Returns true if the record at `slot` carries a delete mark.
    pub fn is_deleted(data: &[u8], slot: usize) -> Result<bool> {
        Ok(Self::record(data, slot)?[0] & RECORD_FLAG_DELETED != 0)
    }

    /// Sets or clears the delete mark. Returns the previous state.
    pub fn set_deleted(data: &mut [u8], slot: usize, deleted: bool) -> Result<bool> {
        let entry = Self::slot(data, slot)?;
        let flags = &mut data[entry.offset as usize];
        let was_deleted = *flags & RECORD_FLAG_DELETED != 0;
        if deleted {
            *flags |= RECORD_FLAG_DELETED;
        } else {
            *flags &= !RECORD_FLAG_DELETED;
        }
        Ok(was_deleted)
    }

    /// Counts records without a delete mark.
    pub fn non_deleted_count(data: &[u8]) -> usize {
        let count = Self::slot_count(data);
        (0..count)
            .filter(|&i| {
                let entry = Self::slot_unchecked(data, i);
                data[entry.offset as usize] & RECORD_FLAG_DELETED == 0
            })
            .count()
    }

    /// Finds the slot holding a record id.
    pub fn find_record_id(data: &[u8], record_id: u32) -> Option<usize> {
        let count = Self::slot_count(data);
        (0..count).find(|&i| Self::slot_unchecked(data, i).record_id == record_id)
    }

    /// Returns the space reclaimable for new records, counting fragmented holes.
    pub fn free_space(data: &[u8]) -> usize {
        let header = Self::header(data);
        let page_size = Self::page_header(data).logical_size();
        let overhead = SLOT_ARRAY_START + header.slot_count as usize * SLOT_SIZE;
        page_size.saturating_sub(overhead + header.used_bytes as usize)
    }

    /// Returns true if a record of `record_len` bytes (flag included) fits.
    pub fn has_space_for(data: &[u8], record_len: usize) -> bool {
        Self::free_space(data) >= record_len + SLOT_SIZE
    }

    /// Inserts a record at `slot`, shifting later slots right.
    ///
    /// `record_id` restores a known id (undo of a purge); otherwise a fresh
    /// id is assigned. Returns the record id, or `PageFull` with the page
    /// unchanged.
    pub fn insert_record(
        data: &mut [u8],
        slot: usize,
        record: &[u8],
        record_id: Option<u32>,
    ) -> Result<u32> {
        let count = Self::slot_count(data);
        if slot > count {
            return Err(ArborError::SlotOutOfRange {
                page_num: Self::page_header(data).page_id.page_num,
                slot,
                count,
            });
        }
        if !Self::has_space_for(data, record.len()) {
            return Err(ArborError::PageFull);
        }
        if Self::header(data).contiguous_free() < record.len() + SLOT_SIZE {
            Self::compact(data);
        }

        let mut header = Self::header(data);
        header.free_space_end -= record.len() as u16;
        let offset = header.free_space_end as usize;
        data[offset..offset + record.len()].copy_from_slice(record);

        // Open a gap in the slot array
        let start = SLOT_ARRAY_START + slot * SLOT_SIZE;
        let end = SLOT_ARRAY_START + count * SLOT_SIZE;
        data.copy_within(start..end, start + SLOT_SIZE);

        let id = match record_id {
            Some(id) => {
                if id >= header.next_record_id {
                    header.next_record_id = id + 1;
                }
                id
            }
            None => {
                let id = header.next_record_id;
                header.next_record_id += 1;
                id
            }
        };

        Self::set_slot(
            data,
            slot,
            RecordSlot {
                offset: offset as u16,
                length: record.len() as u16,
                record_id: id,
            },
        );

        header.slot_count += 1;
        header.free_space_start += SLOT_SIZE as u16;
        header.used_bytes += record.len() as u16;
        Self::set_header(data, header);
        Ok(id)
    }

    /// Removes the record at `slot`, shifting later slots left.
    pub fn remove_record(data: &mut [u8], slot: usize) -> Result<()> {
        let entry = Self::slot(data, slot)?;
        let count = Self::slot_count(data);

        let start = SLOT_ARRAY_START + (slot + 1) * SLOT_SIZE;
        let end = SLOT_ARRAY_START + count * SLOT_SIZE;
        data.copy_within(start..end, start - SLOT_SIZE);

        let mut header = Self::header(data);
        header.slot_count -= 1;
        header.free_space_start -= SLOT_SIZE as u16;
        header.used_bytes -= entry.length;
        if entry.offset == header.free_space_end {
            header.free_space_end += entry.length;
        }
        Self::set_header(data, header);
        Ok(())
    }

    /// Replaces the record at `slot`, keeping its slot and record id.
    /// Returns `PageFull` with the page unchanged if the new record does not fit.
    pub fn replace_record(data: &mut [u8], slot: usize, record: &[u8]) -> Result<()> {
        let mut entry = Self::slot(data, slot)?;
        let old_len = entry.length as usize;

        if record.len() <= old_len {
            let offset = entry.offset as usize;
            data[offset..offset + record.len()].copy_from_slice(record);
            entry.length = record.len() as u16;
            Self::set_slot(data, slot, entry);
            let mut header = Self::header(data);
            header.used_bytes -= (old_len - record.len()) as u16;
            Self::set_header(data, header);
            return Ok(());
        }

        if Self::free_space(data) + old_len < record.len() {
            return Err(ArborError::PageFull);
        }

        // Release the old bytes so compaction skips them
        entry.length = 0;
        Self::set_slot(data, slot, entry);
        let mut header = Self::header(data);
        header.used_bytes -= old_len as u16;
        Self::set_header(data, header);

        if Self::header(data).contiguous_free() < record.len() {
            Self::compact(data);
        }

        let mut header = Self::header(data);
        header.free_space_end -= record.len() as u16;
        let offset = header.free_space_end as usize;
        data[offset..offset + record.len()].copy_from_slice(record);
        header.used_bytes += record.len() as u16;
        Self::set_header(data, header);

        entry.offset = offset as u16;
        entry.length = record.len() as u16;
        Self::set_slot(data, slot, entry);
        Ok(())
    }

    /// Packs all live records against the end of the page.
    fn compact(data: &mut [u8]) {
        let mut header = Self::header(data);
        let page_size = Self::page_header(data).logical_size();
        let count = header.slot_count as usize;

        let records: Vec<(usize, RecordSlot, Vec<u8>)> = (0..count)
            .map(|i| {
                let entry = Self::slot_unchecked(data, i);
                let start = entry.offset as usize;
                (i, entry, data[start..start + entry.length as usize].to_vec())
            })
            .collect();

        let mut end = page_size;
        for (i, mut entry, bytes) in records {
            end -= bytes.len();
            data[end..end + bytes.len()].copy_from_slice(&bytes);
            entry.offset = end as u16;
            Self::set_slot(data, i, entry);
        }

        header.free_space_end = end as u16;
        Self::set_header(data, header);
    }

    /// Stamps the LSN of the last change applied to the page.
    pub fn stamp_lsn(data: &mut [u8], lsn: u64) {
        let mut page_header = Self::page_header(data);
        page_header.lsn = lsn;
        Self::set_page_header(data, &page_header);
    }

    /// Computes the page checksum with the checksum field treated as zero.
    pub fn compute_checksum(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..PageHeader::CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&data[PageHeader::CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }
}

/// Column bitmap selecting which columns a fetch materializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchDescriptor {
    columns: Vec<bool>,
}

impl FetchDescriptor {
    /// Selects the listed column indexes out of `width` columns.
    pub fn new(width: usize, selected: &[usize]) -> Self {
        let mut columns = vec![false; width];
        for &col in selected {
            if col < width {
                columns[col] = true;
            }
        }
        Self { columns }
    }

    /// Selects every column.
    pub fn all(width: usize) -> Self {
        Self {
            columns: vec![true; width],
        }
    }

    /// Returns the column bitmap.
    pub fn columns(&self) -> &[bool] {
        &self.columns
    }

    /// Returns true if the column is selected.
    pub fn is_selected(&self, column: usize) -> bool {
        self.columns.get(column).copied().unwrap_or(false)
    }
}

//! Page structures for Arbor storage.

use serde::{Deserialize, Serialize};

/// Frame size in bytes (16 KB). A container may use a smaller logical page size.
pub const PAGE_SIZE: usize = 16 * 1024;

/// Smallest logical page size a container accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Page number meaning "no page" in sibling, parent and child links.
pub const INVALID_PAGE_NUM: u32 = 0;

/// First page number handed out by a container.
pub const FIRST_PAGE_NUM: u32 = 1;

/// Unique identifier for a page within a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    /// Container identifier.
    pub container_id: u32,
    /// Page number within the container (1-indexed, 0 = invalid).
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(container_id: u32, page_num: u32) -> Self {
        Self {
            container_id,
            page_num,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.container_id, self.page_num)
    }
}

/// Page types in Arbor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated or removed page.
    Free = 0,
    /// Slotted record page.
    Record = 1,
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes total):
/// - page_id: 8 bytes (container_id: 4, page_num: 4)
/// - lsn: 8 bytes (last undo record applied to the page)
/// - page_type: 1 byte
/// - flags: 1 byte
/// - page_size: 2 bytes (logical size, 0 = PAGE_SIZE)
/// - record_count: 2 bytes
/// - checksum: 4 bytes
/// - reserved: 6 bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[repr(C)]
pub struct PageHeader {
    /// Unique page identifier.
    pub page_id: PageId,
    /// Log sequence number of the last modification.
    pub lsn: u64,
    /// Type of this page.
    pub page_type: PageType,
    /// Page flags.
    pub flags: PageFlags,
    /// Logical page size in bytes.
    pub page_size: u16,
    /// Number of records on this page.
    pub record_count: u16,
    /// CRC32 checksum of the page contents (excluding this field).
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Offset of the checksum field within the header.
    pub const CHECKSUM_OFFSET: usize = 22;

    /// Creates a new page header.
    pub fn new(page_id: PageId, page_type: PageType, page_size: usize) -> Self {
        Self {
            page_id,
            lsn: 0,
            page_type,
            flags: PageFlags::empty(),
            page_size: encode_page_size(page_size),
            record_count: 0,
            checksum: 0,
        }
    }

    /// Returns the logical page size in bytes.
    pub fn logical_size(&self) -> usize {
        decode_page_size(self.page_size)
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.container_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.page_id.page_num.to_le_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16] = self.page_type as u8;
        buf[17] = self.flags.0;
        buf[18..20].copy_from_slice(&self.page_size.to_le_bytes());
        buf[20..22].copy_from_slice(&self.record_count.to_le_bytes());
        buf[22..26].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 26-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let container_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let page_num = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let lsn = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let page_type = match buf[16] {
            1 => PageType::Record,
            _ => PageType::Free,
        };
        let flags = PageFlags(buf[17]);
        let page_size = u16::from_le_bytes([buf[18], buf[19]]);
        let record_count = u16::from_le_bytes([buf[20], buf[21]]);
        let checksum = u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]);

        Self {
            page_id: PageId::new(container_id, page_num),
            lsn,
            page_type,
            flags,
            page_size,
            record_count,
            checksum,
        }
    }
}

/// PAGE_SIZE does not fit in a u16, so it is stored as 0.
fn encode_page_size(size: usize) -> u16 {
    if size >= PAGE_SIZE {
        0
    } else {
        size as u16
    }
}

fn decode_page_size(raw: u16) -> usize {
    if raw == 0 {
        PAGE_SIZE
    } else {
        raw as usize
    }
}

/// Flags for page state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags(pub u8);

impl PageFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Page was removed from its container and may be reused.
    pub const FREED: u8 = 0b0000_0010;

    /// Returns true if the freed flag is set.
    pub fn is_freed(&self) -> bool {
        self.0 & Self::FREED != 0
    }

    /// Sets the freed flag.
    pub fn set_freed(&mut self, freed: bool) {
        if freed {
            self.0 |= Self::FREED;
        } else {
            self.0 &= !Self::FREED;
        }
    }
}

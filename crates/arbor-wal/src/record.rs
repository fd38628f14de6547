//! Undo log record format.

use crate::constants::{CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use arbor_common::{ArborError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Log Sequence Number - position of a record within one transaction's log.
///
/// LSNs increase monotonically per log; undo replays them in descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the LSN that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Types of undo records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogRecordType {
    /// A record was inserted at a slot. Undo purges it.
    InsertSlot = 10,
    /// One column of a record was overwritten. Undo restores the before image.
    UpdateField = 11,
    /// A record's delete mark changed. Undo restores the previous mark.
    DeleteMark = 12,
    /// A record was physically removed. Undo reinserts the before image.
    PurgeSlot = 13,
    /// A page was allocated. Undo frees it.
    AllocPage = 20,
    /// A page was freed. Undo restores the full page image.
    FreePage = 21,
}

impl TryFrom<u8> for LogRecordType {
    type Error = ArborError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            10 => Ok(LogRecordType::InsertSlot),
            11 => Ok(LogRecordType::UpdateField),
            12 => Ok(LogRecordType::DeleteMark),
            13 => Ok(LogRecordType::PurgeSlot),
            20 => Ok(LogRecordType::AllocPage),
            21 => Ok(LogRecordType::FreePage),
            _ => Err(ArborError::WalCorrupted {
                lsn: 0,
                reason: format!("invalid record type: {}", value),
            }),
        }
    }
}

/// Record flag: the affected record carried a delete mark before the change.
pub const FLAG_WAS_DELETED: u8 = 0b0000_0001;

/// A single undo log record.
///
/// Record format:
/// - header (24 bytes):
///   - lsn: 8 bytes
///   - prev_lsn: 8 bytes (for transaction chaining)
///   - txn_id: 4 bytes
///   - record_type: 1 byte
///   - flags: 1 byte
///   - payload_len: 2 bytes
/// - payload: variable length
/// - checksum: 4 bytes (CRC32 of header + payload)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// LSN of this record.
    pub lsn: Lsn,
    /// LSN of the previous record in this transaction.
    pub prev_lsn: Lsn,
    /// Transaction ID.
    pub txn_id: u32,
    /// Type of this record.
    pub record_type: LogRecordType,
    /// Record flags.
    pub flags: u8,
    /// Record payload.
    pub payload: Bytes,
}

impl LogRecord {
    /// Size of the record header in bytes.
    pub const HEADER_SIZE: usize = HEADER_SIZE;
    /// Size of the checksum in bytes.
    pub const CHECKSUM_SIZE: usize = CHECKSUM_SIZE;
    /// Maximum payload size.
    pub const MAX_PAYLOAD_SIZE: usize = MAX_PAYLOAD_SIZE;

    /// Creates a new log record.
    pub fn new(
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: u32,
        record_type: LogRecordType,
        flags: u8,
        payload: Bytes,
    ) -> Self {
        Self {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            flags,
            payload,
        }
    }

    /// Returns true if the given flag bit is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Returns the total serialized size of this record.
    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CHECKSUM_SIZE
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());

        buf.put_u64_le(self.lsn.0);
        buf.put_u64_le(self.prev_lsn.0);
        buf.put_u32_le(self.txn_id);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.payload.len() as u16);

        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserializes a record from bytes, verifying its checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE + Self::CHECKSUM_SIZE {
            return Err(ArborError::WalCorrupted {
                lsn: 0,
                reason: "record too short".to_string(),
            });
        }

        let mut cursor = data;
        let lsn = Lsn(cursor.get_u64_le());
        let prev_lsn = Lsn(cursor.get_u64_le());
        let txn_id = cursor.get_u32_le();
        let record_type_raw = cursor.get_u8();
        let flags = cursor.get_u8();
        let payload_len = cursor.get_u16_le() as usize;

        if cursor.len() < payload_len + Self::CHECKSUM_SIZE {
            return Err(ArborError::WalCorrupted {
                lsn: lsn.0,
                reason: "truncated record".to_string(),
            });
        }

        let body_len = Self::HEADER_SIZE + payload_len;
        let computed = crc32fast::hash(&data[..body_len]);
        let stored = (&data[body_len..body_len + Self::CHECKSUM_SIZE]).get_u32_le();
        if stored != computed {
            return Err(ArborError::WalCorrupted {
                lsn: lsn.0,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored, computed
                ),
            });
        }

        let record_type = LogRecordType::try_from(record_type_raw).map_err(|_| {
            ArborError::WalCorrupted {
                lsn: lsn.0,
                reason: format!("invalid record type: {}", record_type_raw),
            }
        })?;
        let payload = Bytes::copy_from_slice(&cursor[..payload_len]);

        Ok(Self {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            flags,
            payload,
        })
    }
}

/// Payload describing one page-level change and its before image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePayload {
    /// Container holding the page.
    pub container_id: u32,
    /// Page being modified.
    pub page_num: u32,
    /// Slot number at the time of the change.
    pub slot: u16,
    /// Record id of the affected record (0 for page-level records).
    pub record_id: u32,
    /// Column index for field updates.
    pub column: u16,
    /// Before image needed to undo the change.
    pub before_image: Option<Bytes>,
}

impl PagePayload {
    /// Creates a payload for a page-level change with no before image.
    pub fn page(container_id: u32, page_num: u32) -> Self {
        Self {
            container_id,
            page_num,
            slot: 0,
            record_id: 0,
            column: 0,
            before_image: None,
        }
    }

    /// Creates a payload for a slot-level change.
    pub fn slot(container_id: u32, page_num: u32, slot: usize, record_id: u32) -> Self {
        Self {
            container_id,
            page_num,
            slot: slot as u16,
            record_id,
            column: 0,
            before_image: None,
        }
    }

    /// Sets the column index.
    pub fn with_column(mut self, column: usize) -> Self {
        self.column = column as u16;
        self
    }

    /// Sets the before image.
    pub fn with_before_image(mut self, image: Bytes) -> Self {
        self.before_image = Some(image);
        self
    }

    /// Serializes the payload to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.container_id);
        buf.put_u32_le(self.page_num);
        buf.put_u16_le(self.slot);
        buf.put_u32_le(self.record_id);
        buf.put_u16_le(self.column);

        if let Some(ref image) = self.before_image {
            buf.put_u32_le(image.len() as u32);
            buf.put_slice(image);
        } else {
            buf.put_u32_le(0);
        }

        buf.freeze()
    }

    /// Deserializes the payload from bytes.
    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(ArborError::WalCorrupted {
                lsn: 0,
                reason: "page payload too short".to_string(),
            });
        }

        let container_id = data.get_u32_le();
        let page_num = data.get_u32_le();
        let slot = data.get_u16_le();
        let record_id = data.get_u32_le();
        let column = data.get_u16_le();

        let image_len = data.get_u32_le() as usize;
        let before_image = if image_len > 0 {
            if data.len() < image_len {
                return Err(ArborError::WalCorrupted {
                    lsn: 0,
                    reason: "truncated before image".to_string(),
                });
            }
            Some(Bytes::copy_from_slice(&data[..image_len]))
        } else {
            None
        };

        Ok(Self {
            container_id,
            page_num,
            slot,
            record_id,
            column,
            before_image,
        })
    }
}

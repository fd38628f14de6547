//! Undo log record format constants.

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Size of the checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Maximum payload size, bounded by the u16 length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Container errors
    #[error("Container not found: {container_id}")]
    ContainerNotFound { container_id: u32 },

    #[error("Page not found: {container_id}:{page_num}")]
    PageNotFound { container_id: u32, page_num: u32 },

    #[error("Page corrupted: {page_num}, reason: {reason}")]
    PageCorrupted { page_num: u32, reason: String },

    #[error("Page full, unable to insert record")]
    PageFull,

    #[error("Record not found: container {container_id}, page {page_num}, record {record_id}")]
    RecordNotFound {
        container_id: u32,
        page_num: u32,
        record_id: u32,
    },

    #[error("Slot {slot} out of range on page {page_num} ({count} slots)")]
    SlotOutOfRange {
        page_num: u32,
        slot: usize,
        count: usize,
    },

    // B-tree errors
    #[error("No space for key on an empty page: container {container_id}, page {page_num}")]
    NoSpaceForKey { container_id: u32, page_num: u32 },

    #[error("B-tree corrupted: container {container_id}, page {page_num}: {reason}")]
    BTreeCorrupted {
        container_id: u32,
        page_num: u32,
        reason: String,
    },

    #[error("Operation not supported by the B-tree access method: {0}")]
    UnimplementedFeature(&'static str),

    #[error("Scan is not positioned on a row")]
    ScanNotPositioned,

    #[error("Scan is closed")]
    ScanClosed,

    // Log errors
    #[error("Log corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    // Type errors
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    // Lock and transaction errors
    #[error("Lock wait timed out: {resource}")]
    LockTimeout { resource: String },

    #[error("Deadlock detected")]
    DeadlockDetected,

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArborError {
    /// Returns true for lock timeout and deadlock errors.
    ///
    /// Background maintenance treats these as a signal to retry later rather
    /// than as a failure.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            ArborError::LockTimeout { .. } | ArborError::DeadlockDetected
        )
    }

    /// Returns true for consistency faults raised by tree checking.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArborError::BTreeCorrupted { .. } | ArborError::PageCorrupted { .. }
        )
    }
}

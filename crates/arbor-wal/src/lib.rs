//! Undo logging for Arbor.
//!
//! Every page mutation made by a transaction appends a record carrying the
//! before image needed to reverse it. Abort replays the log newest first;
//! commit truncates it.

pub mod constants;
pub mod log;
pub mod record;

pub use log::UndoLog;
pub use record::{LogRecord, LogRecordType, Lsn, PagePayload, FLAG_WAS_DELETED};

//! Per-transaction undo log.

use crate::record::{LogRecord, LogRecordType, Lsn, PagePayload};
use arbor_common::Result;
use bytes::Bytes;
use parking_lot::Mutex;

/// Append-only undo log owned by one transaction.
///
/// Records are kept in serialized form, exactly as they would be written
/// to a log file, and are decoded (with checksum verification) only when
/// the owning transaction rolls back.
pub struct UndoLog {
    /// Owning transaction id, stamped on every record.
    txn_id: u32,
    inner: Mutex<UndoLogInner>,
}

struct UndoLogInner {
    /// Serialized records in append order.
    records: Vec<Bytes>,
    /// LSN of the most recent record.
    last_lsn: Lsn,
    /// Total bytes appended since the last truncate.
    bytes_logged: usize,
}

impl UndoLog {
    /// Creates an empty undo log.
    pub fn new(txn_id: u32) -> Self {
        Self {
            txn_id,
            inner: Mutex::new(UndoLogInner {
                records: Vec::new(),
                last_lsn: Lsn::INVALID,
                bytes_logged: 0,
            }),
        }
    }

    /// Returns the owning transaction id.
    pub fn txn_id(&self) -> u32 {
        self.txn_id
    }

    /// Appends a record and returns its LSN.
    pub fn append(&self, record_type: LogRecordType, flags: u8, payload: &PagePayload) -> Lsn {
        let mut inner = self.inner.lock();
        let lsn = inner.last_lsn.next();
        let record = LogRecord::new(
            lsn,
            inner.last_lsn,
            self.txn_id,
            record_type,
            flags,
            payload.serialize(),
        );
        let bytes = record.serialize();
        inner.bytes_logged += bytes.len();
        inner.records.push(bytes);
        inner.last_lsn = lsn;
        lsn
    }

    /// Returns the LSN of the most recent record.
    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    /// Returns the number of records in the log.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Returns the total serialized size of the log.
    pub fn bytes_logged(&self) -> usize {
        self.inner.lock().bytes_logged
    }

    /// Removes every record and returns them newest first, ready for undo.
    pub fn take_for_undo(&self) -> Result<Vec<LogRecord>> {
        let records = {
            let mut inner = self.inner.lock();
            inner.bytes_logged = 0;
            std::mem::take(&mut inner.records)
        };
        records
            .iter()
            .rev()
            .map(|bytes| LogRecord::deserialize(bytes))
            .collect()
    }

    /// Discards every record. Called when the owning transaction commits.
    pub fn truncate(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.bytes_logged = 0;
    }
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UndoLog")
            .field("txn_id", &self.txn_id)
            .field("records", &inner.records.len())
            .field("last_lsn", &inner.last_lsn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_increasing_lsns() {
        let log = UndoLog::new(7);
        let a = log.append(LogRecordType::AllocPage, 0, &PagePayload::page(1, 2));
        let b = log.append(LogRecordType::InsertSlot, 0, &PagePayload::slot(1, 2, 1, 1));
        assert_eq!(a, Lsn::FIRST);
        assert!(b > a);
        assert_eq!(log.last_lsn(), b);
        assert_eq!(log.len(), 2);
        assert!(log.bytes_logged() > 0);
    }

    #[test]
    fn test_take_for_undo_is_newest_first() {
        let log = UndoLog::new(3);
        log.append(LogRecordType::AllocPage, 0, &PagePayload::page(1, 2));
        log.append(LogRecordType::InsertSlot, 0, &PagePayload::slot(1, 2, 1, 1));
        log.append(LogRecordType::DeleteMark, 0, &PagePayload::slot(1, 2, 1, 1));

        let records = log.take_for_undo().unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert_eq!(
            types,
            vec![
                LogRecordType::DeleteMark,
                LogRecordType::InsertSlot,
                LogRecordType::AllocPage
            ]
        );
        assert!(records.iter().all(|r| r.txn_id == 3));
        assert!(log.is_empty());
    }

    #[test]
    fn test_prev_lsn_chain() {
        let log = UndoLog::new(1);
        log.append(LogRecordType::AllocPage, 0, &PagePayload::page(1, 2));
        log.append(LogRecordType::AllocPage, 0, &PagePayload::page(1, 3));
        let records = log.take_for_undo().unwrap();
        assert_eq!(records[0].prev_lsn, records[1].lsn);
        assert_eq!(records[1].prev_lsn, Lsn::INVALID);
    }

    #[test]
    fn test_truncate() {
        let log = UndoLog::new(1);
        log.append(LogRecordType::AllocPage, 0, &PagePayload::page(1, 2));
        log.truncate();
        assert!(log.is_empty());
        assert_eq!(log.bytes_logged(), 0);
        assert!(log.take_for_undo().unwrap().is_empty());
    }
}

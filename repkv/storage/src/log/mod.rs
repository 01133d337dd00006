pub mod entry;
pub mod rep_log;
pub mod utilization;

pub use entry::{DbId, DbOp, DbOpRecord, LnRecord, LogBody, LogEntry, RecordKey, TxnEndRecord};
pub use rep_log::{RepLog, VlsnSource};
pub use utilization::{CountMode, ObsoleteTracker};

use crate::error::StorageResult;

/// Trait for records that can be stored in the log
pub trait LogRecord: Clone + std::fmt::Debug {
    /// Convert the record to bytes for storage
    fn to_bytes(&self) -> StorageResult<Vec<u8>>;

    /// Create a record from bytes
    fn from_bytes(bytes: &[u8]) -> StorageResult<Self>
    where
        Self: Sized;
}

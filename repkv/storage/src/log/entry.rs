use repkv_transaction::{Lsn, MasterIdTerm, TxnId, Vlsn};
use serde::{Deserialize, Serialize};

use super::LogRecord;
use crate::error::{LogError, StorageResult};

/// Internal identifier of a database (a key namespace).
pub type DbId = u32;

/// Fully qualified key of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub db_id: DbId,
    pub key: Vec<u8>,
}

impl RecordKey {
    pub fn new(db_id: DbId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            db_id,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub lsn: Lsn,                // Position of this entry
    pub vlsn: Option<Vlsn>,      // Replication stream position, if replicated
    pub txn_id: TxnId,           // Owning transaction
    pub body: LogBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogBody {
    Ln(LnRecord),
    DbOp(DbOpRecord),
    Commit(TxnEndRecord),
    Abort(TxnEndRecord),
}

/// A record version written by a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnRecord {
    pub key: RecordKey,
    /// `None` marks a deletion.
    pub data: Option<Vec<u8>>,
    /// Version the key had before the owning transaction first touched it. Later writes to
    /// the same key in the same transaction repeat the first version's value.
    pub abort_lsn: Option<Lsn>,
    pub abort_known_deleted: bool,
    /// Previous entry logged by the owning transaction.
    pub prev_lsn: Option<Lsn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbOp {
    Create,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbOpRecord {
    pub db_id: DbId,
    pub op: DbOp,
    pub prev_lsn: Option<Lsn>,
}

/// Body shared by commit and abort records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnEndRecord {
    pub last_lsn: Option<Lsn>,
    pub master_id_term: MasterIdTerm,
    pub dtvlsn: Vlsn,
    pub time_ms: u64,
}

impl LogEntry {
    /// Previous entry of the same transaction, for entries that belong to a chain.
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match &self.body {
            LogBody::Ln(ln) => ln.prev_lsn,
            LogBody::DbOp(op) => op.prev_lsn,
            LogBody::Commit(end) | LogBody::Abort(end) => end.last_lsn,
        }
    }

    pub fn as_txn_end(&self) -> Option<&TxnEndRecord> {
        match &self.body {
            LogBody::Commit(end) | LogBody::Abort(end) => Some(end),
            _ => None,
        }
    }
}

impl LogRecord for LogEntry {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| LogError::SerializationFailed(e.to_string()).into())
    }

    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| LogError::DeserializationFailed(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry {
            lsn: Lsn::new(64),
            vlsn: Some(Vlsn::new(9)),
            txn_id: TxnId::new(-3),
            body: LogBody::Commit(TxnEndRecord {
                last_lsn: Some(Lsn::new(32)),
                master_id_term: MasterIdTerm::new(2, 7),
                dtvlsn: Vlsn::new(8),
                time_ms: 1,
            }),
        };

        let bytes = entry.to_bytes().unwrap();
        let decoded = LogEntry::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.lsn, Lsn::new(64));
        assert_eq!(decoded.vlsn, Some(Vlsn::new(9)));
        assert_eq!(decoded.txn_id, TxnId::new(-3));
        let end = decoded.as_txn_end().unwrap();
        assert_eq!(end.master_id_term, MasterIdTerm::new(2, 7));
        assert_eq!(end.dtvlsn, Vlsn::new(8));
        assert_eq!(decoded.prev_lsn(), Some(Lsn::new(32)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(LogEntry::from_bytes(&[0xff; 3]).is_err());
    }
}

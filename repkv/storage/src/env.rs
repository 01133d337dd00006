use std::collections::HashMap;
use std::sync::OnceLock;

use repkv_transaction::{TransactionIdGenerator, TxnId};
use tracing::{error, info};

use crate::config::LogConfig;
use crate::error::{EnvironmentFailure, FailureReason, StorageError, StorageResult};
use crate::index::{IndexSlot, MemIndex};
use crate::lock::LockManager;
use crate::log::{DbOp, LogBody, LogEntry, RepLog};

/// The pieces of a storage environment shared by every transaction.
pub struct EnvCore {
    log: RepLog,
    locks: LockManager,
    index: MemIndex,
    ids: TransactionIdGenerator,
    failure: OnceLock<EnvironmentFailure>,
}

impl EnvCore {
    /// Creates an environment over an already opened log, rebuilding the index from the
    /// transactions the log shows as committed.
    pub fn new(log: RepLog) -> Self {
        let index = MemIndex::new();
        let (last_replicated, last_local) = recover(&log, &index);
        Self {
            log,
            locks: LockManager::new(),
            index,
            ids: TransactionIdGenerator::with_start(last_replicated, last_local),
            failure: OnceLock::new(),
        }
    }

    pub fn open(config: &LogConfig) -> StorageResult<Self> {
        Ok(Self::new(RepLog::open(config)?))
    }

    pub fn in_memory() -> Self {
        Self::new(RepLog::in_memory())
    }

    pub fn log(&self) -> &RepLog {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn index(&self) -> &MemIndex {
        &self.index
    }

    pub fn ids(&self) -> &TransactionIdGenerator {
        &self.ids
    }

    pub fn is_valid(&self) -> bool {
        self.failure.get().is_none()
    }

    /// Fails once the environment has been invalidated.
    pub fn check_valid(&self) -> StorageResult<()> {
        match self.failure.get() {
            None => Ok(()),
            Some(failure) => Err(EnvironmentFailure {
                reason: FailureReason::EnvironmentInvalid,
                message: format!("environment was invalidated earlier: {}", failure.message),
            }
            .into()),
        }
    }

    /// Invalidates the environment. Only the first failure is kept; the returned error is
    /// meant to be propagated by the caller.
    pub fn invalidate(&self, failure: EnvironmentFailure) -> StorageError {
        error!(reason = ?failure.reason, message = %failure.message, "environment invalidated");
        let _ = self.failure.set(failure.clone());
        StorageError::EnvironmentFailure(failure)
    }

    pub fn failure(&self) -> Option<&EnvironmentFailure> {
        self.failure.get()
    }
}

/// Applies the effects of every committed transaction found in the log to `index`. Returns
/// the last replicated and local transaction ids seen.
fn recover(log: &RepLog, index: &MemIndex) -> (i64, i64) {
    let entries = log.read_all();
    let mut by_txn: HashMap<TxnId, Vec<&LogEntry>> = HashMap::new();
    let mut committed = Vec::new();
    let (mut last_replicated, mut last_local) = (0, 0);
    for entry in &entries {
        let raw = entry.txn_id.raw();
        last_replicated = last_replicated.min(raw);
        last_local = last_local.max(raw);
        match &entry.body {
            LogBody::Commit(_) => committed.push(entry.txn_id),
            LogBody::Abort(_) => {
                by_txn.remove(&entry.txn_id);
            }
            LogBody::Ln(_) | LogBody::DbOp(_) => {
                by_txn.entry(entry.txn_id).or_default().push(entry);
            }
        }
    }

    let mut applied = 0;
    for txn_id in committed {
        let Some(records) = by_txn.remove(&txn_id) else {
            continue;
        };
        for entry in records {
            match &entry.body {
                LogBody::Ln(ln) => {
                    index.put(
                        ln.key.clone(),
                        IndexSlot {
                            lsn: entry.lsn,
                            known_deleted: ln.data.is_none(),
                        },
                    );
                }
                LogBody::DbOp(op) => match op.op {
                    DbOp::Create => {
                        index.create_database(op.db_id);
                    }
                    DbOp::Remove => {
                        index.drop_database(op.db_id);
                    }
                },
                LogBody::Commit(_) | LogBody::Abort(_) => {}
            }
            applied += 1;
        }
    }
    if !entries.is_empty() {
        info!(entries = entries.len(), applied, "recovered environment from log");
    }
    (last_replicated, last_local)
}

#[cfg(test)]
mod tests {
    use repkv_transaction::{Lsn, MasterIdTerm, Vlsn};

    use super::*;
    use crate::log::{LnRecord, RecordKey, TxnEndRecord, VlsnSource};

    #[test]
    fn test_invalidate_keeps_first_failure() {
        let core = EnvCore::in_memory();
        assert!(core.check_valid().is_ok());

        let err = core.invalidate(EnvironmentFailure::unexpected_state("first"));
        assert!(err.is_fatal());
        core.invalidate(EnvironmentFailure::unexpected_state("second"));

        assert_eq!(core.failure().unwrap().message, "first");
        match core.check_valid() {
            Err(StorageError::EnvironmentFailure(f)) => {
                assert_eq!(f.reason, FailureReason::EnvironmentInvalid)
            }
            other => panic!("expected invalid environment, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_applies_committed_only() {
        let log = RepLog::in_memory();
        let write = |txn: i64, key: &str| {
            log.append(
                TxnId::new(txn),
                VlsnSource::Generate,
                LogBody::Ln(LnRecord {
                    key: RecordKey::new(1, key.as_bytes()),
                    data: Some(b"v".to_vec()),
                    abort_lsn: None,
                    abort_known_deleted: true,
                    prev_lsn: None,
                }),
            )
            .unwrap()
            .lsn
        };
        let end = |last: Lsn| TxnEndRecord {
            last_lsn: Some(last),
            master_id_term: MasterIdTerm::new(1, 1),
            dtvlsn: Vlsn::UNINITIALIZED,
            time_ms: 0,
        };

        let a = write(-1, "a");
        log.append(TxnId::new(-1), VlsnSource::Generate, LogBody::Commit(end(a)))
            .unwrap();
        let b = write(-2, "b");
        log.append(TxnId::new(-2), VlsnSource::Generate, LogBody::Abort(end(b)))
            .unwrap();
        write(-3, "c");

        let core = EnvCore::new(log);
        assert_eq!(core.index().get(&RecordKey::new(1, "a")).unwrap().lsn, a);
        assert!(core.index().get(&RecordKey::new(1, "b")).is_none());
        assert!(core.index().get(&RecordKey::new(1, "c")).is_none());
        assert_eq!(core.ids().next_replicated().unwrap(), TxnId::new(-4));
    }
}

//! Applies the replication stream to a replica.

use std::sync::Arc;

use parking_lot::Mutex;
use repkv_transaction::{Lsn, SyncPolicy, TxnId, Vlsn};
use tracing::{debug, info};

use super::env::RepEnvironment;
use super::replay_txn::{ReplayTxn, ReplicatedTxnEnd};
use crate::error::StorageResult;
use crate::log::{DbId, DbOp, RecordKey};

/// One record of the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedEntry {
    Write {
        txn_id: TxnId,
        vlsn: Vlsn,
        key: RecordKey,
        data: Option<Vec<u8>>,
    },
    DbOp {
        txn_id: TxnId,
        vlsn: Vlsn,
        db_id: DbId,
        op: DbOp,
    },
    Commit {
        txn_id: TxnId,
        end: ReplicatedTxnEnd,
        sync: SyncPolicy,
    },
    Abort {
        txn_id: TxnId,
        end: ReplicatedTxnEnd,
    },
}

impl ReplicatedEntry {
    pub fn txn_id(&self) -> TxnId {
        match self {
            ReplicatedEntry::Write { txn_id, .. }
            | ReplicatedEntry::DbOp { txn_id, .. }
            | ReplicatedEntry::Commit { txn_id, .. }
            | ReplicatedEntry::Abort { txn_id, .. } => *txn_id,
        }
    }
}

pub struct Replayer {
    env: Arc<RepEnvironment>,
    /// End record replayed most recently, which the next one must follow.
    last_end: Mutex<Option<ReplicatedTxnEnd>>,
}

impl Replayer {
    pub fn new(env: Arc<RepEnvironment>) -> Self {
        Self {
            env,
            last_end: Mutex::new(None),
        }
    }

    pub fn last_end(&self) -> Option<ReplicatedTxnEnd> {
        *self.last_end.lock()
    }

    fn txn_for(&self, txn_id: TxnId) -> StorageResult<Arc<ReplayTxn>> {
        let registry = self.env.replay_registry();
        if let Some(txn) = registry.get(txn_id) {
            return Ok(txn);
        }
        ReplayTxn::new(
            self.env.core().clone(),
            txn_id,
            self.env.config().replay_txn_lock_timeout,
            Some(registry.clone()),
        )
    }

    /// Applies `entry` and returns the position it was logged at, if any.
    pub fn apply(&self, entry: ReplicatedEntry) -> StorageResult<Option<Lsn>> {
        let txn = self.txn_for(entry.txn_id())?;
        match entry {
            ReplicatedEntry::Write {
                vlsn, key, data, ..
            } => Ok(Some(txn.replay_write(key, data, vlsn)?)),
            ReplicatedEntry::DbOp {
                vlsn, db_id, op, ..
            } => Ok(Some(txn.replay_db_op(db_id, op, vlsn)?)),
            ReplicatedEntry::Commit { end, sync, .. } => {
                let mut last_end = self.last_end.lock();
                txn.set_rep_context(end);
                if let Some(prev) = last_end.as_ref() {
                    txn.check_commit_follows(prev)?;
                }
                let lsn = txn.commit_with(sync, end)?;
                *last_end = Some(end);
                debug!(txn_id = %txn.base().id(), vlsn = %end.vlsn, "applied commit");
                Ok(lsn)
            }
            ReplicatedEntry::Abort { end, .. } => {
                let mut last_end = self.last_end.lock();
                txn.abort_with(Some(end))?;
                *last_end = Some(end);
                Ok(None)
            }
        }
    }

    /// Rolls every active replay transaction back to `matchpoint`. Returns the undone
    /// positions, newest first.
    pub fn rollback(&self, matchpoint: Lsn) -> StorageResult<Vec<Lsn>> {
        let mut undone = Vec::new();
        for txn in self.env.replay_registry().txns() {
            undone.extend(txn.rollback(matchpoint)?);
        }
        undone.sort_unstable_by(|a, b| b.cmp(a));
        info!(%matchpoint, undone = undone.len(), "rolled back to matchpoint");
        Ok(undone)
    }
}

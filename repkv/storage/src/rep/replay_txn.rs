//! Replica-side transaction that reproduces a master transaction from the replication stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use repkv_transaction::{
    Durability, IdError, Lsn, MasterIdTerm, SyncPolicy, Transaction, TxnId, TxnState, Vlsn,
};
use tracing::{debug, info};

use super::registry::ActiveTxns;
use super::txn_chain::TxnChain;
use crate::env::EnvCore;
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::lock::WriteLockInfo;
use crate::log::{CountMode, DbId, DbOp, LogBody, LogEntry, RecordKey, VlsnSource};
use crate::txn::{PendingDbOp, Txn, TxnHooks, TxnInner};

const DEFAULT_REPLAY_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Coordinates of a replicated commit or abort record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatedTxnEnd {
    pub vlsn: Vlsn,
    pub master_id_term: MasterIdTerm,
    pub dtvlsn: Vlsn,
}

pub struct ReplayTxn {
    txn: Txn,
    /// Present for transactions created from the live stream, absent during recovery.
    registry: Option<Arc<ActiveTxns>>,
    rep_context: Mutex<Option<ReplicatedTxnEnd>>,
    started: Instant,
    ended: Mutex<Option<Instant>>,
    rolled_back: AtomicBool,
}

impl ReplayTxn {
    /// Creates a replay transaction for the replicated id `txn_id` and registers it.
    ///
    /// Replay transactions are importunate and never use a zero lock timeout: a blocked replay
    /// must be resolved by preempting the reader, not by giving up.
    pub fn new(
        core: Arc<EnvCore>,
        txn_id: TxnId,
        lock_timeout: Duration,
        registry: Option<Arc<ActiveTxns>>,
    ) -> StorageResult<Arc<Self>> {
        if !txn_id.is_replicated() {
            return Err(TransactionError::Id(IdError::WrongDomainReplicated(txn_id.raw())).into());
        }
        core.ids()
            .update_replicated(txn_id)
            .map_err(TransactionError::Id)?;
        let lock_timeout = if lock_timeout.is_zero() {
            DEFAULT_REPLAY_LOCK_TIMEOUT
        } else {
            lock_timeout
        };

        let txn = Arc::new(Self {
            txn: Txn::new(txn_id, core, lock_timeout, true),
            registry,
            rep_context: Mutex::new(None),
            started: Instant::now(),
            ended: Mutex::new(None),
            rolled_back: AtomicBool::new(false),
        });
        if let Some(registry) = &txn.registry {
            if !registry.put(txn.clone()) {
                return Err(TransactionError::IllegalState(format!(
                    "replay transaction {txn_id} is already active"
                ))
                .into());
            }
        }
        Ok(txn)
    }

    pub fn base(&self) -> &Txn {
        &self.txn
    }

    pub fn lock_timeout(&self) -> Duration {
        self.txn.lock_timeout()
    }

    pub fn is_importunate(&self) -> bool {
        self.txn.is_importunate()
    }

    pub fn first_logged_lsn(&self) -> Option<Lsn> {
        self.txn.first_logged_lsn()
    }

    pub fn last_logged_lsn(&self) -> Option<Lsn> {
        self.txn.last_logged_lsn()
    }

    pub fn write_locks(&self) -> Vec<(Lsn, WriteLockInfo)> {
        self.txn.write_locks()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::Acquire)
    }

    /// Time between creation and the end of the transaction, or now if it is still open.
    pub fn elapsed_time(&self) -> Duration {
        match *self.ended.lock() {
            Some(ended) => ended.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    pub fn set_rep_context(&self, end: ReplicatedTxnEnd) {
        *self.rep_context.lock() = Some(end);
    }

    pub fn rep_context(&self) -> Option<ReplicatedTxnEnd> {
        *self.rep_context.lock()
    }

    /// DTVLSN of the attached end record, or `Vlsn::NULL` if none is attached.
    pub fn dtvlsn(&self) -> Vlsn {
        self.rep_context()
            .map(|end| end.dtvlsn)
            .unwrap_or(Vlsn::NULL)
    }

    /// Applies a replicated record version.
    pub fn replay_write(
        &self,
        key: RecordKey,
        data: Option<Vec<u8>>,
        vlsn: Vlsn,
    ) -> StorageResult<Lsn> {
        self.txn.write(self, key, data, VlsnSource::Replicated(vlsn))
    }

    /// Applies a replicated database create or remove.
    pub fn replay_db_op(&self, db_id: DbId, op: DbOp, vlsn: Vlsn) -> StorageResult<Lsn> {
        self.txn.db_op(self, db_id, op, VlsnSource::Replicated(vlsn))
    }

    /// Checks that this transaction's end record may follow `prev`, the end record replayed
    /// just before it. Any violation invalidates the environment.
    pub fn check_commit_follows(&self, prev: &ReplicatedTxnEnd) -> StorageResult<()> {
        let Some(this) = self.rep_context() else {
            return Err(TransactionError::IllegalState(format!(
                "replay transaction {} has no replicated end record",
                self.txn.id()
            ))
            .into());
        };
        let violation = if prev.dtvlsn > this.dtvlsn {
            Some(format!(
                "DTVLSN went backwards: {} after {}",
                this.dtvlsn, prev.dtvlsn
            ))
        } else if prev.vlsn >= this.vlsn {
            Some(format!("VLSN did not advance: {} after {}", this.vlsn, prev.vlsn))
        } else if !prev.master_id_term.precedes(&this.master_id_term) {
            Some(format!(
                "master term {} cannot follow {}",
                this.master_id_term, prev.master_id_term
            ))
        } else {
            None
        };
        match violation {
            Some(message) => Err(self.txn.fatal(format!(
                "replay of txn {} out of order: {message}",
                self.txn.id()
            ))),
            None => Ok(()),
        }
    }

    /// Writes the replicated commit record. Durability and VLSN come from the stream.
    pub fn commit_with(
        &self,
        sync: SyncPolicy,
        end: ReplicatedTxnEnd,
    ) -> StorageResult<Option<Lsn>> {
        self.set_rep_context(end);
        let result = self.txn.commit(self, Durability::replay(sync));
        *self.ended.lock() = Some(Instant::now());
        result
    }

    /// Aborts, writing the replicated abort record when `end` is given.
    pub fn abort_with(&self, end: Option<ReplicatedTxnEnd>) -> StorageResult<()> {
        if let Some(end) = end {
            self.set_rep_context(end);
        }
        let result = self.txn.abort(self);
        *self.ended.lock() = Some(Instant::now());
        result
    }

    /// Takes over a write lock from the master transaction this replay transaction replaces.
    /// The lock cannot be held by anyone else, so failure invalidates the environment.
    pub fn steal_lock_from_master_txn(
        &self,
        lsn: Lsn,
        from: TxnId,
        info: WriteLockInfo,
    ) -> StorageResult<()> {
        self.txn.steal_lock(lsn, from, info).map_err(|e| {
            self.txn.fatal(format!(
                "replay txn {} could not take over lock {lsn} from {from}: {e}",
                self.txn.id()
            ))
        })
    }

    /// Takes over the database operations of a converted master transaction.
    pub(crate) fn adopt_pending_db_ops(&self, ops: BTreeMap<DbId, PendingDbOp>) {
        self.txn.inner().pending_db_ops.extend(ops);
    }

    /// Undoes every record this transaction logged after `matchpoint`, newest first, and
    /// returns their positions. If nothing remains the transaction is closed as aborted.
    pub fn rollback(&self, matchpoint: Lsn) -> StorageResult<Vec<Lsn>> {
        let _op = self.txn.op_guard();
        let core = self.txn.core().clone();
        let mut inner = self.txn.inner();
        if !inner.state.is_open() {
            return Ok(Vec::new());
        }
        let Some(last) = inner.last_logged_lsn else {
            return Ok(Vec::new());
        };
        if last <= matchpoint {
            return Ok(Vec::new());
        }
        self.rolled_back.store(true, Ordering::Release);

        let chain = TxnChain::build(core.log(), last, matchpoint)?;
        let mut undone = Vec::new();
        let mut cursor = Some(last);
        while let Some(lsn) = cursor {
            if lsn <= matchpoint {
                break;
            }
            let entry = core.log().fetch(lsn)?;
            self.undo_record(&core, &mut inner, &chain, &entry)?;
            if inner.write_info.remove(&lsn).is_some() {
                core.locks().release(lsn, self.txn.id());
            }
            undone.push(lsn);
            cursor = entry.prev_lsn();
            inner.last_logged_lsn = cursor;
        }

        if inner.last_logged_lsn.is_none() {
            inner.first_logged_lsn = None;
            for (db_id, pending) in std::mem::take(&mut inner.pending_db_ops) {
                if pending.created_lsn.is_some() {
                    core.index().drop_database(db_id);
                }
            }
            self.txn.close_locked(self, &mut inner, TxnState::Aborted)?;
        }
        info!(
            txn_id = %self.txn.id(),
            %matchpoint,
            undone = undone.len(),
            closed = !inner.state.is_open(),
            "rolled back replay transaction"
        );
        Ok(undone)
    }

    fn undo_record(
        &self,
        core: &EnvCore,
        inner: &mut TxnInner,
        chain: &TxnChain,
        entry: &LogEntry,
    ) -> StorageResult<()> {
        match &entry.body {
            LogBody::Ln(ln) => {
                let Some(revert) = chain.revert_for(entry.lsn) else {
                    return Err(self.txn.fatal(format!(
                        "no revert target for {} of replay txn {}",
                        entry.lsn,
                        self.txn.id()
                    )));
                };
                core.index()
                    .revert(&ln.key, entry.lsn, revert.lsn, revert.known_deleted);
                // Rolled-back records may be counted again by a later abort.
                core.log().count_obsolete(entry.lsn, CountMode::Inexact);
                Ok(())
            }
            LogBody::DbOp(op) => {
                let Some(pending) = inner.pending_db_ops.get(&op.db_id).copied() else {
                    return Ok(());
                };
                if pending.lsn != entry.lsn {
                    return Ok(());
                }
                match (op.op, pending.created_lsn) {
                    (DbOp::Remove, Some(created)) if created < entry.lsn => {
                        inner.pending_db_ops.insert(
                            op.db_id,
                            PendingDbOp {
                                op: DbOp::Create,
                                lsn: created,
                                created_lsn: Some(created),
                            },
                        );
                    }
                    (DbOp::Create, _) => {
                        core.index().drop_database(op.db_id);
                        inner.pending_db_ops.remove(&op.db_id);
                    }
                    _ => {
                        inner.pending_db_ops.remove(&op.db_id);
                    }
                }
                core.log().count_obsolete(entry.lsn, CountMode::Inexact);
                Ok(())
            }
            LogBody::Commit(_) | LogBody::Abort(_) => Err(self.txn.fatal(format!(
                "replay txn {} chain reached end record at {}",
                self.txn.id(),
                entry.lsn
            ))),
        }
    }
}

impl TxnHooks for ReplayTxn {
    fn has_loggable_updates(&self, inner: &TxnInner) -> bool {
        inner.last_logged_lsn.is_some() || self.rep_context.lock().is_some()
    }

    fn end_vlsn_source(&self) -> VlsnSource {
        match self.rep_context() {
            Some(end) => VlsnSource::Replicated(end.vlsn),
            None => VlsnSource::Local,
        }
    }

    fn master_id_term(&self) -> MasterIdTerm {
        self.rep_context()
            .map(|end| end.master_id_term)
            .unwrap_or(MasterIdTerm::PRIMORDIAL)
    }

    fn dtvlsn(&self) -> Vlsn {
        ReplayTxn::dtvlsn(self)
    }

    fn post_log_commit_hook(&self, entry: &LogEntry) -> StorageResult<()> {
        if let Some(end) = entry.as_txn_end() {
            self.txn.core().log().update_dtvlsn(end.dtvlsn);
        }
        debug!(txn_id = %self.txn.id(), lsn = %entry.lsn, "replayed commit");
        Ok(())
    }

    fn close_hook(&self) -> StorageResult<()> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        if registry.remove(self.txn.id()).is_none() {
            return Err(self.txn.fatal(format!(
                "replay txn {} was missing from the active transactions",
                self.txn.id()
            )));
        }
        Ok(())
    }
}

impl Transaction for ReplayTxn {
    type Error = StorageError;

    fn txn_id(&self) -> TxnId {
        self.txn.id()
    }

    fn state(&self) -> TxnState {
        self.txn.state()
    }

    fn commit(&self) -> Result<Option<Lsn>, Self::Error> {
        Err(TransactionError::Unsupported(
            "replay transactions commit with the replicated sync policy".to_string(),
        )
        .into())
    }

    fn abort(&self) -> Result<(), Self::Error> {
        Err(TransactionError::Unsupported(
            "replay transactions abort with a replicated end record".to_string(),
        )
        .into())
    }
}

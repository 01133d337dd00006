//! Master-side transaction: quorum acknowledgment and master-to-replica conversion.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use repkv_transaction::{
    ConsistencyPolicy, Durability, Lsn, MasterIdTerm, Transaction, TransactionConfig, TxnId,
    TxnState, Vlsn,
};
use tracing::{debug, info};

use super::block_latch::LatchStamp;
use super::env::RepEnvironment;
use super::latch::{AckLatch, AsyncAckHandler, QuorumLatch};
use super::replay_txn::ReplayTxn;
use crate::error::{LockError, ReplicationError, StorageError, StorageResult, TransactionError};
use crate::lock::{LockGrant, LockType, WriteLockInfo};
use crate::log::{DbId, DbOp, LogEntry, RecordKey, VlsnSource};
use crate::txn::{Txn, TxnHooks, TxnInner};

const ACK_TIMEOUT_NOT_STARTED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MasterTxnKind {
    Application,
    /// Content-free transaction that only carries the DTVLSN forward.
    Watermark,
}

pub struct MasterTxn {
    txn: Txn,
    env: Arc<RepEnvironment>,
    kind: MasterTxnKind,
    self_ref: Weak<MasterTxn>,
    durability: Durability,
    async_handler: Mutex<Option<Arc<dyn AsyncAckHandler>>>,
    /// Set by the role-transition thread without taking any transaction mutex.
    frozen: AtomicBool,
    latch: OnceLock<Arc<QuorumLatch>>,
    /// Set once the commit finished locally and an async handler may fire.
    collecting_acks: AtomicBool,
    required_acks: AtomicUsize,
    commit_vlsn: OnceLock<Vlsn>,
    ack_start_ns: AtomicU64,
    ack_deadline_ns: AtomicU64,
    block_latch_stamp: Mutex<Option<LatchStamp>>,
}

impl MasterTxn {
    /// Starts a write transaction on the master.
    ///
    /// Unless the transaction needs no replica acks, this waits for the master to become
    /// authoritative before any lock can be taken.
    pub fn begin(
        env: &Arc<RepEnvironment>,
        config: &TransactionConfig,
    ) -> StorageResult<Arc<Self>> {
        Self::begin_kind(env, config, MasterTxnKind::Application)
    }

    pub(crate) fn begin_kind(
        env: &Arc<RepEnvironment>,
        config: &TransactionConfig,
        kind: MasterTxnKind,
    ) -> StorageResult<Arc<Self>> {
        if config.consistency == ConsistencyPolicy::Absolute && !config.read_only {
            return Err(TransactionError::IllegalArgument(
                "absolute consistency is only supported for read-only transactions".to_string(),
            )
            .into());
        }
        env.core().check_valid()?;
        let txn_id = env
            .core()
            .ids()
            .next_replicated()
            .map_err(TransactionError::Id)?;
        let durability = config
            .durability
            .unwrap_or(env.config().default_durability);
        if env.required_ack_count(durability.replica_ack) > 0 {
            env.await_authoritative(txn_id)?;
        }
        let lock_timeout = config.lock_timeout.unwrap_or(env.config().txn_lock_timeout);

        let txn = Arc::new_cyclic(|self_ref| Self {
            txn: Txn::new(txn_id, env.core().clone(), lock_timeout, false),
            env: env.clone(),
            kind,
            self_ref: self_ref.clone(),
            durability,
            async_handler: Mutex::new(None),
            frozen: AtomicBool::new(false),
            latch: OnceLock::new(),
            collecting_acks: AtomicBool::new(false),
            required_acks: AtomicUsize::new(0),
            commit_vlsn: OnceLock::new(),
            ack_start_ns: AtomicU64::new(ACK_TIMEOUT_NOT_STARTED),
            ack_deadline_ns: AtomicU64::new(ACK_TIMEOUT_NOT_STARTED),
            block_latch_stamp: Mutex::new(None),
        });
        env.register_master_txn(txn.clone());
        debug!(%txn_id, ?kind, "began master transaction");
        Ok(txn)
    }

    pub fn base(&self) -> &Txn {
        &self.txn
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn put(&self, key: RecordKey, value: impl Into<Vec<u8>>) -> StorageResult<Lsn> {
        self.txn.write(self, key, Some(value.into()), VlsnSource::Generate)
    }

    pub fn delete(&self, key: RecordKey) -> StorageResult<Lsn> {
        self.txn.write(self, key, None, VlsnSource::Generate)
    }

    pub fn get(&self, key: &RecordKey) -> StorageResult<Option<Vec<u8>>> {
        self.txn.get(self, key)
    }

    pub fn create_database(&self, db_id: DbId) -> StorageResult<Lsn> {
        self.txn.db_op(self, db_id, DbOp::Create, VlsnSource::Generate)
    }

    pub fn remove_database(&self, db_id: DbId) -> StorageResult<Lsn> {
        self.txn.db_op(self, db_id, DbOp::Remove, VlsnSource::Generate)
    }

    /// Locks a position after checking the node's current role.
    pub fn lock(&self, lsn: Lsn, lock_type: LockType) -> StorageResult<LockGrant> {
        self.txn.lock(self, lsn, lock_type)
    }

    /// Locks a record this transaction already logged. Skips the role check, since the record
    /// must not stay unlocked in the log, but still fails if a replay preempted our locks.
    pub fn lock_post_log_non_blocking(&self, lsn: Lsn, info: WriteLockInfo) -> StorageResult<()> {
        self.txn.lock_after_log(lsn, info)?;
        self.post_log_lock_hook()
    }

    pub fn commit_with_durability(&self, durability: Durability) -> StorageResult<Option<Lsn>> {
        let result = self.txn.commit(self, durability);
        self.check_block_latch_released()?;
        result
    }

    /// Routes the ack outcome of the coming commit to `handler` instead of blocking.
    pub fn set_async_ack_handler(&self, handler: Arc<dyn AsyncAckHandler>) -> StorageResult<()> {
        if self.latch.get().is_some() {
            return Err(TransactionError::IllegalState(format!(
                "txn {} already started committing",
                self.txn.id()
            ))
            .into());
        }
        *self.async_handler.lock() = Some(handler);
        Ok(())
    }

    pub fn async_ack_handler(&self) -> StorageResult<Arc<dyn AsyncAckHandler>> {
        self.async_handler.lock().clone().ok_or_else(|| {
            TransactionError::IllegalState(format!(
                "txn {} has no async ack handler",
                self.txn.id()
            ))
            .into()
        })
    }

    pub(crate) fn latch(&self) -> Option<&Arc<QuorumLatch>> {
        self.latch.get()
    }

    pub fn is_async_commit(&self) -> bool {
        self.latch.get().is_some_and(|latch| latch.is_async())
    }

    /// Blocks until every required ack arrived or `timeout` elapsed. Returns at once, with
    /// false, if the transaction gets frozen while waiting.
    pub fn await_acks(&self, timeout: Duration) -> bool {
        match self.latch.get() {
            None => true,
            Some(latch) => latch.await_with_timeout(timeout, &|| self.is_frozen()),
        }
    }

    pub fn count_down_ack(&self) {
        if let Some(latch) = self.latch.get() {
            latch.count_down();
        }
    }

    pub fn pending_acks(&self) -> usize {
        self.latch.get().map_or(0, |latch| latch.count())
    }

    /// Acks required by the commit, fixed when the commit started.
    pub fn required_ack_count(&self) -> usize {
        self.required_acks.load(Ordering::Acquire)
    }

    pub(crate) fn start_collecting_acks(&self) {
        self.collecting_acks.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_collecting_acks(&self) -> bool {
        self.collecting_acks.load(Ordering::SeqCst)
    }

    pub fn commit_vlsn(&self) -> Option<Vlsn> {
        self.commit_vlsn.get().copied()
    }

    /// Master transactions leave the DTVLSN for the log to fill in.
    pub fn dtvlsn(&self) -> Vlsn {
        Vlsn::UNINITIALIZED
    }

    /// Opens the ack window: acks are expected within `timeout` from now.
    pub fn start_ack_timeouts(&self, timeout: Duration) {
        let now = self.env.clock_ns();
        self.ack_start_ns.store(now, Ordering::Release);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.ack_deadline_ns
            .store(now.saturating_add(timeout_ns), Ordering::Release);
    }

    pub fn ack_timed_out(&self, now_ns: u64) -> bool {
        let deadline = self.ack_deadline_ns.load(Ordering::Acquire);
        deadline != ACK_TIMEOUT_NOT_STARTED && now_ns >= deadline
    }

    pub fn ack_start_ns(&self) -> Option<u64> {
        match self.ack_start_ns.load(Ordering::Acquire) {
            ACK_TIMEOUT_NOT_STARTED => None,
            start => Some(start),
        }
    }

    /// Stops the transaction from making progress while a master transfer runs.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        if let Some(latch) = self.latch.get() {
            latch.wake_waiters();
        }
    }

    pub(crate) fn unfreeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Takes the node's block latch in read mode for the duration of an end record write.
    pub fn lock_read_block_latch(&self) -> StorageResult<()> {
        let mut stamp = self.block_latch_stamp.lock();
        if stamp.is_some() {
            return Err(TransactionError::IllegalState(format!(
                "txn {} already holds the block latch",
                self.txn.id()
            ))
            .into());
        }
        let timeout = self.env.config().block_latch_timeout();
        match self.env.block_latch().try_read_lock(timeout) {
            Some(acquired) => {
                *stamp = Some(acquired);
                Ok(())
            }
            None => Err(self.txn.fatal(format!(
                "txn {} could not take the block latch within {}ms",
                self.txn.id(),
                timeout.as_millis()
            ))),
        }
    }

    pub fn unlock_read_block_latch(&self) {
        if let Some(stamp) = self.block_latch_stamp.lock().take() {
            self.env.block_latch().unlock_read(stamp);
        }
    }

    fn check_block_latch_released(&self) -> StorageResult<()> {
        if self.block_latch_stamp.lock().is_some() {
            return Err(self.txn.fatal(format!(
                "txn {} still holds the block latch after ending",
                self.txn.id()
            )));
        }
        Ok(())
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

    /// Hands this frozen transaction's write locks and logged records to a new replay
    /// transaction with the same id, then closes this one.
    ///
    /// Returns `None` when there is nothing to hand over: the transaction already ended, holds
    /// no write locks (it stays open), or logged nothing (its locks are released).
    pub fn convert_and_close(&self) -> StorageResult<Option<Arc<ReplayTxn>>> {
        if !self.is_frozen() {
            return Err(TransactionError::IllegalState(format!(
                "txn {} must be frozen before conversion",
                self.txn.id()
            ))
            .into());
        }
        let _op = self.txn.op_guard();
        // Blocked committers give up and report insufficient acks.
        if let Some(latch) = self.latch.get() {
            latch.release_waiters();
        }

        let txn_id = self.txn.id();
        let mut inner = self.txn.inner();
        if !inner.state.is_open() || inner.write_info.is_empty() {
            self.unfreeze();
            return Ok(None);
        }
        // Any later commit attempt must fail instead of silently succeeding.
        inner.state = TxnState::MustAbort;

        if inner.last_logged_lsn.is_none() {
            self.unfreeze();
            self.txn.close_locked(self, &mut inner, TxnState::Closed)?;
            return Ok(None);
        }

        let replay = ReplayTxn::new(
            self.txn.core().clone(),
            txn_id,
            self.env.config().replay_txn_lock_timeout,
            Some(self.env.replay_registry().clone()),
        )?;
        let mut moved = 0;
        while let Some((lsn, info)) = inner.write_info.pop_first() {
            replay.steal_lock_from_master_txn(lsn, txn_id, info)?;
            moved += 1;
        }
        replay.adopt_pending_db_ops(std::mem::take(&mut inner.pending_db_ops));
        inner.first_logged_lsn = None;
        inner.last_logged_lsn = None;
        self.txn.release_other_locks(&mut inner);

        self.unfreeze();
        self.txn.close_locked(self, &mut inner, TxnState::Closed)?;
        info!(
            %txn_id,
            locks = moved,
            first = ?replay.first_logged_lsn(),
            last = ?replay.last_logged_lsn(),
            "converted master transaction to replay transaction"
        );
        Ok(Some(replay))
    }
}

impl TxnHooks for MasterTxn {
    fn lock_hook(&self) -> StorageResult<()> {
        self.env.check_if_master(self.txn.id())?;
        if self.is_frozen() {
            return Err(ReplicationError::UnknownMaster {
                txn_id: self.txn.id(),
            }
            .into());
        }
        Ok(())
    }

    fn post_log_lock_hook(&self) -> StorageResult<()> {
        if self.txn.core().locks().is_preempted(self.txn.id()) {
            return Err(LockError::Preempted {
                txn_id: self.txn.id(),
            }
            .into());
        }
        Ok(())
    }

    fn pre_log_hook(&self) -> StorageResult<()> {
        self.env.check_if_master(self.txn.id())
    }

    fn has_loggable_updates(&self, inner: &TxnInner) -> bool {
        match self.kind {
            MasterTxnKind::Watermark => true,
            MasterTxnKind::Application => inner.last_logged_lsn.is_some(),
        }
    }

    fn check_lock_invariant(&self, inner: &TxnInner) -> StorageResult<()> {
        if self.kind == MasterTxnKind::Application {
            return Ok(());
        }
        if inner.state == TxnState::Committed
            || (inner.holds_no_locks() && inner.last_logged_lsn.is_none())
        {
            return Ok(());
        }
        Err(self.txn.fatal(format!(
            "watermark txn {} in unexpected state {:?} with {} write locks, {} other locks, \
             last logged {:?}",
            self.txn.id(),
            inner.state,
            inner.write_info.len(),
            inner.other_locks.len(),
            inner.last_logged_lsn
        )))
    }

    fn pre_log_commit_hook(&self, durability: &Durability) -> StorageResult<()> {
        let mut required = self.env.required_ack_count(durability.replica_ack);
        if self.env.config().group_commit {
            // The master's own ack.
            required += 1;
        }
        let handler = self.async_handler.lock().clone();
        let latch = Arc::new(QuorumLatch::for_required(required, handler));
        if self.latch.set(latch).is_err() {
            return Err(TransactionError::IllegalState(format!(
                "txn {} allocated its quorum latch twice",
                self.txn.id()
            ))
            .into());
        }
        self.required_acks.store(required, Ordering::Release);
        self.env.pre_log_commit(self.txn.id())?;
        self.lock_read_block_latch()
    }

    fn pre_log_abort_hook(&self) -> StorageResult<()> {
        self.env.check_if_master(self.txn.id())?;
        self.lock_read_block_latch()
    }

    fn finalize_hook(&self, is_commit: bool) -> StorageResult<()> {
        if !self.is_frozen() {
            return Ok(());
        }
        if let Err(e) = self.env.check_if_master(self.txn.id()) {
            if is_commit {
                self.post_log_commit_abort_hook();
            } else {
                self.unlock_read_block_latch();
            }
            return Err(e);
        }
        Ok(())
    }

    fn end_vlsn_source(&self) -> VlsnSource {
        VlsnSource::Generate
    }

    fn master_id_term(&self) -> MasterIdTerm {
        self.env.capture_master_term()
    }

    fn commit_vlsn_hook(&self, vlsn: Vlsn) {
        // Registered before the VLSN is visible, so whoever sees it can ack it.
        if self.required_ack_count() > 0 {
            if let Some(txn) = self.self_ref.upgrade() {
                self.env.register_awaiting_ack(vlsn, txn);
            }
        }
        let _ = self.commit_vlsn.set(vlsn);
    }

    fn dtvlsn(&self) -> Vlsn {
        MasterTxn::dtvlsn(self)
    }

    fn post_log_end_hook(&self) {
        self.unlock_read_block_latch();
    }

    fn post_log_commit_hook(&self, entry: &LogEntry) -> StorageResult<()> {
        if let Some(vlsn) = entry.vlsn {
            let _ = self.commit_vlsn.set(vlsn);
        }
        match self.self_ref.upgrade() {
            Some(txn) => self.env.post_log_commit(&txn),
            None => Ok(()),
        }
    }

    fn post_log_commit_abort_hook(&self) {
        self.unlock_read_block_latch();
        if let Some(vlsn) = self.commit_vlsn() {
            self.env.forget_awaiting_ack(vlsn);
        }
    }

    fn close_hook(&self) -> StorageResult<()> {
        self.env.deregister_master_txn(self.txn.id());
        Ok(())
    }
}

impl Transaction for MasterTxn {
    type Error = StorageError;

    fn txn_id(&self) -> TxnId {
        self.txn.id()
    }

    fn state(&self) -> TxnState {
        self.txn.state()
    }

    fn commit(&self) -> Result<Option<Lsn>, Self::Error> {
        self.commit_with_durability(self.durability)
    }

    fn abort(&self) -> Result<(), Self::Error> {
        let result = self.txn.abort(self);
        self.check_block_latch_released()?;
        result
    }
}

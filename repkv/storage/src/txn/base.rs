use std::collections::{BTreeMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use repkv_transaction::{Durability, Lsn, MasterIdTerm, TxnId, TxnState, Vlsn};
use tracing::{debug, warn};

use crate::env::EnvCore;
use crate::error::{
    EnvironmentFailure, LockError, StorageError, StorageResult, TransactionError,
};
use crate::index::IndexSlot;
use crate::lock::{LockGrant, LockType, LockWait, WriteLockInfo};
use crate::log::rep_log::now_ms;
use crate::log::{
    CountMode, DbId, DbOp, DbOpRecord, LnRecord, LogBody, LogEntry, RecordKey, TxnEndRecord,
    VlsnSource,
};

/// A database operation that takes effect when its transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDbOp {
    pub op: DbOp,
    /// Position of the record that logged `op`.
    pub lsn: Lsn,
    /// Position of the create record, when this transaction created the database.
    pub created_lsn: Option<Lsn>,
}

/// Mutable bookkeeping of a transaction.
#[derive(Debug)]
pub struct TxnInner {
    pub state: TxnState,
    /// Write locks on the positions this transaction logged.
    pub write_info: BTreeMap<Lsn, WriteLockInfo>,
    /// Locks on positions this transaction did not log.
    pub other_locks: BTreeMap<Lsn, LockType>,
    pub first_logged_lsn: Option<Lsn>,
    pub last_logged_lsn: Option<Lsn>,
    pub pending_db_ops: BTreeMap<DbId, PendingDbOp>,
}

impl TxnInner {
    fn new() -> Self {
        Self {
            state: TxnState::Open,
            write_info: BTreeMap::new(),
            other_locks: BTreeMap::new(),
            first_logged_lsn: None,
            last_logged_lsn: None,
            pending_db_ops: BTreeMap::new(),
        }
    }

    /// Widens the logged range to include `lsn`.
    pub fn record_logged(&mut self, lsn: Lsn) {
        if self.first_logged_lsn.is_none_or(|first| lsn < first) {
            self.first_logged_lsn = Some(lsn);
        }
        if self.last_logged_lsn.is_none_or(|last| lsn > last) {
            self.last_logged_lsn = Some(lsn);
        }
    }

    pub fn holds_no_locks(&self) -> bool {
        self.write_info.is_empty() && self.other_locks.is_empty()
    }

    /// First version of `key` this transaction logged, which carries the key's abort info.
    fn first_write_of(&self, key: &RecordKey) -> Option<&WriteLockInfo> {
        self.write_info
            .values()
            .find(|info| info.key.as_ref() == Some(key))
    }
}

/// Points at which a transaction kind customises the shared commit and abort sequences.
///
/// `commit` runs: lock-invariant check, pre-log-commit, finalize, append of the commit record
/// (master term and DTVLSN captured under the log-append mutex), end-of-logging, local flush,
/// obsolete accounting, lock release and close, then post-log-commit once the transaction
/// mutex is released. `abort` follows the same shape with its own hooks.
pub(crate) trait TxnHooks {
    /// Runs before every lock request and write made on behalf of the application.
    fn lock_hook(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Runs after a logged record was locked without going through `lock_hook`.
    fn post_log_lock_hook(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Runs before a record is appended.
    fn pre_log_hook(&self) -> StorageResult<()> {
        Ok(())
    }

    fn has_loggable_updates(&self, inner: &TxnInner) -> bool {
        inner.last_logged_lsn.is_some()
    }

    fn check_lock_invariant(&self, _inner: &TxnInner) -> StorageResult<()> {
        Ok(())
    }

    fn pre_log_commit_hook(&self, _durability: &Durability) -> StorageResult<()> {
        Ok(())
    }

    fn pre_log_abort_hook(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Last chance to refuse writing the end record. An implementation that fails must undo
    /// whatever its pre-log hook set up.
    fn finalize_hook(&self, _is_commit: bool) -> StorageResult<()> {
        Ok(())
    }

    /// VLSN assignment for the commit or abort record.
    fn end_vlsn_source(&self) -> VlsnSource;

    /// Called while the log-append mutex is held.
    fn master_id_term(&self) -> MasterIdTerm;

    /// Called while the log-append mutex is held, with the VLSN a commit record is about to
    /// get. Anything published here is visible before the record itself is.
    fn commit_vlsn_hook(&self, _vlsn: Vlsn) {}

    /// DTVLSN to embed in the end record. `Vlsn::UNINITIALIZED` asks the log to fill in the
    /// current watermark.
    fn dtvlsn(&self) -> Vlsn;

    /// Runs right after an end record was appended, or failed to be.
    fn post_log_end_hook(&self) {}

    fn post_log_commit_hook(&self, _entry: &LogEntry) -> StorageResult<()> {
        Ok(())
    }

    /// Cleanup when a commit fails after `pre_log_commit_hook` succeeded.
    fn post_log_commit_abort_hook(&self) {}

    fn post_log_abort_hook(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Runs when the transaction is closed, with its bookkeeping mutex held.
    fn close_hook(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// State and behavior shared by every transaction kind.
pub struct Txn {
    id: TxnId,
    core: Arc<EnvCore>,
    importunate: bool,
    lock_timeout: Duration,
    /// Serializes whole operations: writes, commit, abort, conversion and rollback.
    op_lock: Mutex<()>,
    inner: Mutex<TxnInner>,
}

impl Txn {
    pub fn new(id: TxnId, core: Arc<EnvCore>, lock_timeout: Duration, importunate: bool) -> Self {
        Self {
            id,
            core,
            importunate,
            lock_timeout,
            op_lock: Mutex::new(()),
            inner: Mutex::new(TxnInner::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn core(&self) -> &Arc<EnvCore> {
        &self.core
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn is_importunate(&self) -> bool {
        self.importunate
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn first_logged_lsn(&self) -> Option<Lsn> {
        self.inner.lock().first_logged_lsn
    }

    pub fn last_logged_lsn(&self) -> Option<Lsn> {
        self.inner.lock().last_logged_lsn
    }

    pub fn write_locks(&self) -> Vec<(Lsn, WriteLockInfo)> {
        self.inner
            .lock()
            .write_info
            .iter()
            .map(|(lsn, info)| (*lsn, info.clone()))
            .collect()
    }

    pub fn write_lock_count(&self) -> usize {
        self.inner.lock().write_info.len()
    }

    pub fn pending_db_ops(&self) -> BTreeMap<DbId, PendingDbOp> {
        self.inner.lock().pending_db_ops.clone()
    }

    pub(crate) fn op_guard(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, TxnInner> {
        self.inner.lock()
    }

    fn check_open(&self, inner: &TxnInner) -> StorageResult<()> {
        match inner.state {
            TxnState::Open => Ok(()),
            TxnState::MustAbort => Err(TransactionError::MustAbort(self.id).into()),
            _ => Err(TransactionError::NotOpen(self.id).into()),
        }
    }

    fn acquire(&self, lsn: Lsn, lock_type: LockType) -> StorageResult<LockGrant> {
        let wait = if self.lock_timeout.is_zero() {
            LockWait::NoWait
        } else {
            LockWait::Timeout(self.lock_timeout)
        };
        match self
            .core
            .locks()
            .lock(lsn, self.id, lock_type, wait, self.importunate)?
        {
            LockGrant::Denied => Err(LockError::Denied {
                lsn,
                txn_id: self.id,
            }
            .into()),
            grant => Ok(grant),
        }
    }

    /// Locks the current version of `key`, retrying if the version moves while waiting.
    fn lock_current_version(
        &self,
        key: &RecordKey,
        lock_type: LockType,
    ) -> StorageResult<Option<(IndexSlot, LockGrant)>> {
        let index = self.core.index();
        loop {
            let Some(slot) = index.get(key) else {
                return Ok(None);
            };
            let grant = self.acquire(slot.lsn, lock_type)?;
            if index.get(key).map(|s| s.lsn) == Some(slot.lsn) {
                return Ok(Some((slot, grant)));
            }
            if grant == LockGrant::New {
                self.core.locks().release(slot.lsn, self.id);
            }
        }
    }

    /// Takes a lock on a position this transaction does not write.
    pub(crate) fn lock(
        &self,
        hooks: &dyn TxnHooks,
        lsn: Lsn,
        lock_type: LockType,
    ) -> StorageResult<LockGrant> {
        hooks.lock_hook()?;
        self.check_open(&self.inner())?;
        let grant = self.acquire(lsn, lock_type)?;
        if matches!(grant, LockGrant::New | LockGrant::Promotion) {
            let mut inner = self.inner();
            if !inner.write_info.contains_key(&lsn) {
                inner.other_locks.insert(lsn, lock_type);
            }
        }
        Ok(grant)
    }

    /// Locks a position that was just logged by this transaction and records it as written.
    /// No hook runs; the caller decides what to check afterwards.
    pub(crate) fn lock_after_log(&self, lsn: Lsn, info: WriteLockInfo) -> StorageResult<()> {
        match self.core.locks().lock(
            lsn,
            self.id,
            info.lock_type,
            LockWait::NoWait,
            self.importunate,
        )? {
            LockGrant::Denied => {
                return Err(LockError::Denied {
                    lsn,
                    txn_id: self.id,
                }
                .into());
            }
            grant => debug!(txn_id = %self.id, %lsn, ?grant, "locked logged record"),
        }
        let mut inner = self.inner();
        inner.write_info.insert(lsn, info);
        inner.record_logged(lsn);
        Ok(())
    }

    /// Takes over the lock another transaction holds on `lsn`, in one step.
    pub(crate) fn steal_lock(
        &self,
        lsn: Lsn,
        from: TxnId,
        info: WriteLockInfo,
    ) -> Result<(), LockError> {
        self.core
            .locks()
            .steal(lsn, from, self.id, info.lock_type)?;
        let mut inner = self.inner();
        inner.write_info.insert(lsn, info);
        inner.record_logged(lsn);
        Ok(())
    }

    /// Reads the current value of `key` under a read lock.
    pub(crate) fn get(
        &self,
        hooks: &dyn TxnHooks,
        key: &RecordKey,
    ) -> StorageResult<Option<Vec<u8>>> {
        let _op = self.op_lock.lock();
        hooks.lock_hook()?;
        self.check_open(&self.inner())?;
        let Some((slot, grant)) = self.lock_current_version(key, LockType::Read)? else {
            return Ok(None);
        };
        if grant == LockGrant::New {
            self.inner().other_locks.insert(slot.lsn, LockType::Read);
        }
        if slot.known_deleted {
            return Ok(None);
        }
        match &self.core.log().fetch(slot.lsn)?.body {
            LogBody::Ln(ln) => Ok(ln.data.clone()),
            _ => Err(TransactionError::IllegalState(format!(
                "index slot of {key:?} points at a non-record entry {}",
                slot.lsn
            ))
            .into()),
        }
    }

    /// Writes a new version of `key`. `None` deletes it.
    pub(crate) fn write(
        &self,
        hooks: &dyn TxnHooks,
        key: RecordKey,
        data: Option<Vec<u8>>,
        vlsn: VlsnSource,
    ) -> StorageResult<Lsn> {
        let _op = self.op_lock.lock();
        hooks.lock_hook()?;
        self.check_open(&self.inner())?;
        if !self.core.index().has_database(key.db_id) {
            return Err(TransactionError::IllegalArgument(format!(
                "database {} does not exist",
                key.db_id
            ))
            .into());
        }

        let current = self.lock_current_version(&key, LockType::Write)?;
        let result = self.log_write(hooks, &key, data, vlsn, current.map(|(slot, _)| slot));

        // The lock on the replaced version only guarded the write itself.
        if let Some((slot, LockGrant::New)) = current {
            if !self.inner().write_info.contains_key(&slot.lsn) {
                self.core.locks().release(slot.lsn, self.id);
            }
        }
        result
    }

    fn log_write(
        &self,
        hooks: &dyn TxnHooks,
        key: &RecordKey,
        data: Option<Vec<u8>>,
        vlsn: VlsnSource,
        prior: Option<IndexSlot>,
    ) -> StorageResult<Lsn> {
        hooks.pre_log_hook()?;
        let (prev_lsn, first) = {
            let inner = self.inner();
            (inner.last_logged_lsn, inner.first_write_of(key).cloned())
        };
        let (abort_lsn, abort_known_deleted, created_this_txn) = match first {
            Some(info) => (info.abort_lsn, info.abort_known_deleted, info.created_this_txn),
            None => (
                prior.map(|slot| slot.lsn),
                prior.is_none_or(|slot| slot.known_deleted),
                prior.is_none(),
            ),
        };
        let known_deleted = data.is_none();

        let entry = self.core.log().append(
            self.id,
            vlsn,
            LogBody::Ln(LnRecord {
                key: key.clone(),
                data,
                abort_lsn,
                abort_known_deleted,
                prev_lsn,
            }),
        )?;
        self.lock_after_log(
            entry.lsn,
            WriteLockInfo {
                lock_type: LockType::Write,
                key: Some(key.clone()),
                abort_lsn,
                abort_known_deleted,
                created_this_txn,
            },
        )?;
        self.core.index().put(
            key.clone(),
            IndexSlot {
                lsn: entry.lsn,
                known_deleted,
            },
        );
        hooks.post_log_lock_hook()?;
        Ok(entry.lsn)
    }

    /// Logs a database create or remove. A create takes effect at once and is undone by abort;
    /// a remove takes effect at commit.
    pub(crate) fn db_op(
        &self,
        hooks: &dyn TxnHooks,
        db_id: DbId,
        op: DbOp,
        vlsn: VlsnSource,
    ) -> StorageResult<Lsn> {
        let _op = self.op_lock.lock();
        hooks.lock_hook()?;
        self.check_open(&self.inner())?;
        let exists = self.core.index().has_database(db_id);
        match op {
            DbOp::Create if exists => {
                return Err(TransactionError::IllegalArgument(format!(
                    "database {db_id} already exists"
                ))
                .into());
            }
            DbOp::Remove if !exists => {
                return Err(TransactionError::IllegalArgument(format!(
                    "database {db_id} does not exist"
                ))
                .into());
            }
            _ => {}
        }
        hooks.pre_log_hook()?;

        let prev_lsn = self.inner().last_logged_lsn;
        let entry = self.core.log().append(
            self.id,
            vlsn,
            LogBody::DbOp(DbOpRecord {
                db_id,
                op,
                prev_lsn,
            }),
        )?;
        self.lock_after_log(entry.lsn, WriteLockInfo::for_database())?;
        if op == DbOp::Create {
            self.core.index().create_database(db_id);
        }
        {
            let mut inner = self.inner();
            let created_lsn = match op {
                DbOp::Create => Some(entry.lsn),
                DbOp::Remove => inner
                    .pending_db_ops
                    .get(&db_id)
                    .and_then(|pending| pending.created_lsn),
            };
            inner.pending_db_ops.insert(
                db_id,
                PendingDbOp {
                    op,
                    lsn: entry.lsn,
                    created_lsn,
                },
            );
        }
        hooks.post_log_lock_hook()?;
        Ok(entry.lsn)
    }

    pub(crate) fn commit(
        &self,
        hooks: &dyn TxnHooks,
        durability: Durability,
    ) -> StorageResult<Option<Lsn>> {
        let op = self.op_lock.lock();
        {
            let inner = self.inner();
            self.check_open(&inner)?;
            hooks.check_lock_invariant(&inner)?;
            if !hooks.has_loggable_updates(&inner) {
                drop(inner);
                self.close(hooks, TxnState::Committed)?;
                return Ok(None);
            }
        }

        hooks.pre_log_commit_hook(&durability)?;
        hooks.finalize_hook(true)?;

        let last_lsn = self.inner().last_logged_lsn;
        let entry = match self.log_txn_end(hooks, last_lsn, true) {
            Ok(entry) => entry,
            Err(e) => {
                hooks.post_log_end_hook();
                hooks.post_log_commit_abort_hook();
                return Err(e);
            }
        };
        hooks.post_log_end_hook();

        if let Err(e) = self.core.log().flush(durability.local_sync) {
            hooks.post_log_commit_abort_hook();
            return Err(self.core.invalidate(EnvironmentFailure::log_write(format!(
                "commit record of txn {} could not be flushed: {e}",
                self.id
            ))));
        }
        self.apply_commit();
        self.close(hooks, TxnState::Committed)?;
        drop(op);

        if let Err(e) = hooks.post_log_commit_hook(&entry) {
            if e.propagates_after_commit() {
                return Err(e);
            }
            warn!(txn_id = %self.id, error = %e, "ignoring failure after commit");
        }
        Ok(Some(entry.lsn))
    }

    pub(crate) fn abort(&self, hooks: &dyn TxnHooks) -> StorageResult<()> {
        let op = self.op_lock.lock();
        let (loggable, last_lsn) = {
            let inner = self.inner();
            match inner.state {
                TxnState::Open | TxnState::MustAbort => {}
                TxnState::Aborted | TxnState::Closed => return Ok(()),
                TxnState::Committed => return Err(TransactionError::NotOpen(self.id).into()),
            }
            (hooks.has_loggable_updates(&inner), inner.last_logged_lsn)
        };

        if loggable {
            hooks.pre_log_abort_hook()?;
            hooks.finalize_hook(false)?;
            let result = self.log_txn_end(hooks, last_lsn, false);
            hooks.post_log_end_hook();
            result?;
        }

        self.undo_all();
        self.close(hooks, TxnState::Aborted)?;
        drop(op);
        hooks.post_log_abort_hook()
    }

    fn log_txn_end(
        &self,
        hooks: &dyn TxnHooks,
        last_lsn: Option<Lsn>,
        is_commit: bool,
    ) -> StorageResult<Arc<LogEntry>> {
        let dtvlsn = hooks.dtvlsn();
        self.core
            .log()
            .append_with(self.id, hooks.end_vlsn_source(), |vlsn, current| {
                if let Some(vlsn) = vlsn.filter(|_| is_commit) {
                    hooks.commit_vlsn_hook(vlsn);
                }
                let end = TxnEndRecord {
                    last_lsn,
                    master_id_term: hooks.master_id_term(),
                    dtvlsn: if dtvlsn == Vlsn::UNINITIALIZED {
                        current
                    } else {
                        dtvlsn
                    },
                    time_ms: now_ms(),
                };
                if is_commit {
                    LogBody::Commit(end)
                } else {
                    LogBody::Abort(end)
                }
            })
    }

    /// The newest version of every written key stays live; older versions, and the version
    /// each key had before this transaction, become obsolete.
    fn apply_commit(&self) {
        let log = self.core.log();
        let index = self.core.index();
        let mut inner = self.inner();
        let mut seen = HashSet::new();
        for (lsn, info) in inner.write_info.iter().rev() {
            let Some(key) = &info.key else {
                continue;
            };
            if seen.insert(key.clone()) {
                if let Some(abort_lsn) = info.abort_lsn {
                    log.count_obsolete(abort_lsn, CountMode::Exact);
                }
                if index.get(key).is_some_and(|slot| slot.lsn == *lsn && slot.known_deleted) {
                    log.count_obsolete(*lsn, CountMode::Exact);
                }
            } else {
                log.count_obsolete(*lsn, CountMode::Exact);
            }
        }
        for (db_id, pending) in mem::take(&mut inner.pending_db_ops) {
            if pending.op == DbOp::Remove {
                index.drop_database(db_id);
            }
        }
    }

    /// Restores every written key to the version it had before this transaction and drops
    /// the databases it created.
    pub(crate) fn undo_all(&self) {
        let log = self.core.log();
        let index = self.core.index();
        let mut inner = self.inner();
        let mut restored = HashSet::new();
        for (lsn, info) in inner.write_info.iter().rev() {
            log.count_obsolete(*lsn, CountMode::Exact);
            let Some(key) = &info.key else {
                continue;
            };
            if restored.insert(key.clone()) {
                index.revert(key, *lsn, info.abort_lsn, info.abort_known_deleted);
            }
        }
        for (db_id, pending) in mem::take(&mut inner.pending_db_ops) {
            if pending.created_lsn.is_some() {
                index.drop_database(db_id);
            }
        }
    }

    pub(crate) fn close(&self, hooks: &dyn TxnHooks, state: TxnState) -> StorageResult<()> {
        let mut inner = self.inner();
        self.close_locked(hooks, &mut inner, state)
    }

    /// Releases every lock and moves to a terminal state without writing a record.
    pub(crate) fn close_locked(
        &self,
        hooks: &dyn TxnHooks,
        inner: &mut TxnInner,
        state: TxnState,
    ) -> StorageResult<()> {
        let locks = self.core.locks();
        for lsn in mem::take(&mut inner.write_info).into_keys() {
            locks.release(lsn, self.id);
        }
        for lsn in mem::take(&mut inner.other_locks).into_keys() {
            locks.release(lsn, self.id);
        }
        locks.clear_preempted(self.id);
        inner.state = state;
        debug!(txn_id = %self.id, ?state, "transaction closed");
        hooks.close_hook()
    }

    /// Releases the locks on positions this transaction did not log.
    pub(crate) fn release_other_locks(&self, inner: &mut TxnInner) {
        for lsn in mem::take(&mut inner.other_locks).into_keys() {
            self.core.locks().release(lsn, self.id);
        }
    }

    pub(crate) fn fatal(&self, message: String) -> StorageError {
        self.core
            .invalidate(EnvironmentFailure::unexpected_state(message))
    }
}

#[cfg(test)]
mod tests {
    use repkv_transaction::SyncPolicy;

    use super::*;

    /// Hooks of a plain local transaction.
    struct LocalHooks;

    impl TxnHooks for LocalHooks {
        fn end_vlsn_source(&self) -> VlsnSource {
            VlsnSource::Local
        }

        fn master_id_term(&self) -> MasterIdTerm {
            MasterIdTerm::PRIMORDIAL
        }

        fn dtvlsn(&self) -> Vlsn {
            Vlsn::NULL
        }
    }

    fn setup() -> Arc<EnvCore> {
        let core = Arc::new(EnvCore::in_memory());
        core.index().create_database(1);
        core
    }

    fn local_txn(core: &Arc<EnvCore>) -> Txn {
        let id = core.ids().next_local().unwrap();
        Txn::new(id, core.clone(), Duration::from_millis(50), false)
    }

    const NO_SYNC: Durability = Durability::replay(SyncPolicy::NoSync);

    #[test]
    fn test_write_commit_and_read() {
        let core = setup();
        let key = RecordKey::new(1, "k");

        let txn = local_txn(&core);
        let first = txn
            .write(&LocalHooks, key.clone(), Some(b"v1".to_vec()), VlsnSource::Local)
            .unwrap();
        let second = txn
            .write(&LocalHooks, key.clone(), Some(b"v2".to_vec()), VlsnSource::Local)
            .unwrap();
        assert_eq!(txn.first_logged_lsn(), Some(first));
        assert_eq!(txn.last_logged_lsn(), Some(second));
        assert_eq!(txn.write_lock_count(), 2);

        let commit_lsn = txn.commit(&LocalHooks, NO_SYNC).unwrap().unwrap();
        assert!(commit_lsn > second);
        assert_eq!(txn.state(), TxnState::Committed);
        assert!(core.locks().locks_held_by(txn.id()).is_empty());
        // The older in-transaction version is obsolete, the newest is live.
        assert!(core.log().obsolete().is_counted_exact(first));
        assert!(!core.log().obsolete().is_counted_exact(second));

        let entry = core.log().fetch(commit_lsn).unwrap();
        assert_eq!(entry.as_txn_end().unwrap().last_lsn, Some(second));

        let reader = local_txn(&core);
        assert_eq!(reader.get(&LocalHooks, &key).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_abort_restores_prior_versions() {
        let core = setup();
        let key = RecordKey::new(1, "k");

        let writer = local_txn(&core);
        let committed = writer
            .write(&LocalHooks, key.clone(), Some(b"old".to_vec()), VlsnSource::Local)
            .unwrap();
        writer.commit(&LocalHooks, NO_SYNC).unwrap();

        let txn = local_txn(&core);
        txn.write(&LocalHooks, key.clone(), Some(b"new".to_vec()), VlsnSource::Local)
            .unwrap();
        txn.write(&LocalHooks, RecordKey::new(1, "fresh"), Some(b"x".to_vec()), VlsnSource::Local)
            .unwrap();
        txn.abort(&LocalHooks).unwrap();

        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(core.index().get(&key).unwrap().lsn, committed);
        assert!(core.index().get(&RecordKey::new(1, "fresh")).is_none());
        // Aborting twice is harmless.
        txn.abort(&LocalHooks).unwrap();
    }

    #[test]
    fn test_write_conflict_times_out() {
        let core = setup();
        let key = RecordKey::new(1, "k");

        let t1 = local_txn(&core);
        t1.write(&LocalHooks, key.clone(), Some(b"a".to_vec()), VlsnSource::Local)
            .unwrap();

        let t2 = local_txn(&core);
        let err = t2
            .write(&LocalHooks, key.clone(), Some(b"b".to_vec()), VlsnSource::Local)
            .unwrap_err();
        assert!(matches!(err, StorageError::Lock(LockError::Timeout { .. })));
        assert_eq!(t2.last_logged_lsn(), None);
    }

    #[test]
    fn test_created_database_is_dropped_on_abort() {
        let core = setup();
        let txn = local_txn(&core);
        txn.db_op(&LocalHooks, 7, DbOp::Create, VlsnSource::Local).unwrap();
        txn.write(&LocalHooks, RecordKey::new(7, "k"), Some(b"v".to_vec()), VlsnSource::Local)
            .unwrap();
        assert!(core.index().has_database(7));

        txn.abort(&LocalHooks).unwrap();
        assert!(!core.index().has_database(7));
        assert!(core.index().get(&RecordKey::new(7, "k")).is_none());
    }

    #[test]
    fn test_remove_database_takes_effect_at_commit() {
        let core = setup();
        let txn = local_txn(&core);
        txn.db_op(&LocalHooks, 1, DbOp::Remove, VlsnSource::Local).unwrap();
        assert!(core.index().has_database(1));
        txn.commit(&LocalHooks, NO_SYNC).unwrap();
        assert!(!core.index().has_database(1));
    }

    #[test]
    fn test_must_abort_rejects_commit() {
        let core = setup();
        let txn = local_txn(&core);
        txn.inner().state = TxnState::MustAbort;
        let err = txn.commit(&LocalHooks, NO_SYNC).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Transaction(TransactionError::MustAbort(_))
        ));
        txn.abort(&LocalHooks).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
    }
}

//! Replicated environment: the node-wide state master and replay transactions share.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use repkv_transaction::{
    MasterIdTerm, ReplicaAckPolicy, Transaction, TransactionConfig, TxnId, Vlsn,
};
use tracing::{debug, info, warn};

use super::block_latch::{BlockLatch, LatchStamp};
use super::latch::AckLatch;
use super::master_txn::{MasterTxn, MasterTxnKind};
use super::null_txn::WatermarkTxn;
use super::quorum::QuorumPolicy;
use super::registry::ActiveTxns;
use super::replay_txn::ReplayTxn;
use super::role::{AuthoritativeGate, MasterTermAccessor, NodeState, ReplicaRole, RoleSource};
use crate::config::RepConfig;
use crate::env::EnvCore;
use crate::error::{ReplicationError, StorageError, StorageResult};

pub struct RepEnvironment {
    config: RepConfig,
    core: Arc<EnvCore>,
    roles: Arc<dyn RoleSource>,
    gate: Arc<dyn AuthoritativeGate>,
    quorum: Arc<dyn QuorumPolicy>,
    block_latch: BlockLatch,
    term_accessor: MasterTermAccessor,
    master_txns: SkipMap<TxnId, Arc<MasterTxn>>,
    replay_txns: Arc<ActiveTxns>,
    /// Committed master transactions still collecting acks, by commit VLSN.
    awaiting_acks: Mutex<BTreeMap<Vlsn, Arc<MasterTxn>>>,
    epoch: Instant,
}

impl RepEnvironment {
    /// Opens the log named by `config` and drives roles from `node`.
    pub fn open(
        config: RepConfig,
        node: Arc<NodeState>,
        quorum: Arc<dyn QuorumPolicy>,
    ) -> StorageResult<Arc<Self>> {
        let core = Arc::new(EnvCore::open(&config.log)?);
        Ok(Self::new(config, core, node.clone(), node, quorum))
    }

    pub fn new(
        config: RepConfig,
        core: Arc<EnvCore>,
        roles: Arc<dyn RoleSource>,
        gate: Arc<dyn AuthoritativeGate>,
        quorum: Arc<dyn QuorumPolicy>,
    ) -> Arc<Self> {
        info!(node_id = config.node_id, "opened replicated environment");
        Arc::new(Self {
            config,
            core,
            roles,
            gate,
            quorum,
            block_latch: BlockLatch::new(),
            term_accessor: MasterTermAccessor::new(),
            master_txns: SkipMap::new(),
            replay_txns: Arc::new(ActiveTxns::new()),
            awaiting_acks: Mutex::new(BTreeMap::new()),
            epoch: Instant::now(),
        })
    }

    pub fn config(&self) -> &RepConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<EnvCore> {
        &self.core
    }

    pub fn roles(&self) -> &Arc<dyn RoleSource> {
        &self.roles
    }

    pub fn block_latch(&self) -> &BlockLatch {
        &self.block_latch
    }

    pub fn replay_registry(&self) -> &Arc<ActiveTxns> {
        &self.replay_txns
    }

    /// Monotonic nanoseconds since the environment was created.
    pub fn clock_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn begin_master_txn(
        self: &Arc<Self>,
        config: &TransactionConfig,
    ) -> StorageResult<Arc<MasterTxn>> {
        MasterTxn::begin(self, config)
    }

    pub fn master_txn(&self, txn_id: TxnId) -> Option<Arc<MasterTxn>> {
        self.master_txns
            .get(&txn_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of the open master transactions in id order.
    pub fn active_master_txns(&self) -> Vec<Arc<MasterTxn>> {
        self.master_txns
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn register_master_txn(&self, txn: Arc<MasterTxn>) {
        self.master_txns.insert(txn.txn_id(), txn);
    }

    pub(crate) fn deregister_master_txn(&self, txn_id: TxnId) {
        self.master_txns.remove(&txn_id);
    }

    pub fn required_ack_count(&self, policy: ReplicaAckPolicy) -> usize {
        self.quorum.required_ack_count(policy)
    }

    pub fn capture_master_term(&self) -> MasterIdTerm {
        self.term_accessor.capture(self.roles.as_ref())
    }

    /// Fails unless this node is currently the master.
    pub fn check_if_master(&self, txn_id: TxnId) -> StorageResult<()> {
        match self.roles.current_role() {
            ReplicaRole::Master => Ok(()),
            ReplicaRole::Replica => Err(ReplicationError::ReplicaWrite {
                txn_id,
                master: self.roles.known_master(),
            }
            .into()),
            ReplicaRole::Unknown => Err(ReplicationError::UnknownMaster { txn_id }.into()),
        }
    }

    pub(crate) fn await_authoritative(&self, txn_id: TxnId) -> StorageResult<()> {
        let timeout = self.config.authoritative_timeout;
        match self.gate.await_authoritative(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReplicationError::NotAuthoritative {
                txn_id,
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
            Err(e) => Err(StorageError::ThreadInterrupted(format!(
                "txn {txn_id} waiting for the master to become authoritative: {e}"
            ))),
        }
    }

    /// Runs before a master commit record is written.
    pub(crate) fn pre_log_commit(&self, txn_id: TxnId) -> StorageResult<()> {
        self.check_if_master(txn_id)
    }

    /// Publishes a commit that needs acks under its VLSN. Runs under the log-append mutex,
    /// so a replica can never ack a commit record that is not registered yet.
    pub(crate) fn register_awaiting_ack(&self, vlsn: Vlsn, txn: Arc<MasterTxn>) {
        self.awaiting_acks.lock().insert(vlsn, txn);
    }

    pub(crate) fn forget_awaiting_ack(&self, vlsn: Vlsn) {
        self.awaiting_acks.lock().remove(&vlsn);
    }

    /// Collects acks for a commit record that was just written.
    ///
    /// Replica acks may have arrived since the record was appended; they were counted down
    /// already. Blocking commits wait here. Commits with an async handler return at once;
    /// their handler runs from here, [`RepEnvironment::replica_ack`] or
    /// [`RepEnvironment::sweep_ack_timeouts`].
    pub(crate) fn post_log_commit(&self, txn: &Arc<MasterTxn>) -> StorageResult<()> {
        let Some(latch) = txn.latch().cloned() else {
            return Ok(());
        };
        let Some(vlsn) = txn.commit_vlsn() else {
            return Ok(());
        };
        if txn.required_ack_count() == 0 {
            self.core.log().update_dtvlsn(vlsn);
            if let Ok(handler) = txn.async_ack_handler() {
                handler.on_quorum(txn.txn_id(), vlsn);
            }
            return Ok(());
        }
        if self.config.group_commit {
            latch.count_down();
        }

        if latch.is_async() {
            txn.start_ack_timeouts(self.config.replica_ack_timeout);
            txn.start_collecting_acks();
            self.complete_if_acknowledged(vlsn, txn);
            return Ok(());
        }

        let timeout = self.config.replica_ack_timeout;
        let acked = txn.await_acks(timeout);
        self.forget_awaiting_ack(vlsn);
        if !acked {
            let required = txn.required_ack_count();
            let received = required.saturating_sub(latch.count());
            warn!(txn_id = %txn.txn_id(), %vlsn, required, received, "insufficient acks");
            return Err(ReplicationError::InsufficientAcks {
                txn_id: txn.txn_id(),
                required,
                received,
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }
        self.core.log().update_dtvlsn(vlsn);
        Ok(())
    }

    /// Records a replica's ack of the commit with `vlsn`. Returns false if no committed
    /// transaction is waiting for it.
    pub fn replica_ack(&self, vlsn: Vlsn) -> bool {
        let txn = self.awaiting_acks.lock().get(&vlsn).cloned();
        let Some(txn) = txn else {
            return false;
        };
        txn.count_down_ack();
        debug!(txn_id = %txn.txn_id(), %vlsn, pending = txn.pending_acks(), "replica ack");
        if txn.is_collecting_acks() {
            self.complete_if_acknowledged(vlsn, &txn);
        }
        true
    }

    /// Fires the async handler once the last ack arrived. The handler is taken, so it runs
    /// at most once even when an ack races with the end of the commit.
    fn complete_if_acknowledged(&self, vlsn: Vlsn, txn: &Arc<MasterTxn>) {
        if txn.pending_acks() > 0 {
            return;
        }
        self.core.log().update_dtvlsn(vlsn);
        let Some(latch) = txn.latch() else {
            return;
        };
        let Some(async_latch) = latch.as_async() else {
            return;
        };
        self.forget_awaiting_ack(vlsn);
        if let Some(handler) = async_latch.take_handler() {
            handler.on_quorum(txn.txn_id(), vlsn);
        }
    }

    /// Fails every async commit whose ack window has closed. Returns how many were failed.
    pub fn sweep_ack_timeouts(&self) -> usize {
        let now = self.clock_ns();
        let expired: Vec<(Vlsn, Arc<MasterTxn>)> = {
            let mut awaiting = self.awaiting_acks.lock();
            let vlsns: Vec<Vlsn> = awaiting
                .iter()
                .filter(|(_, txn)| txn.is_async_commit() && txn.ack_timed_out(now))
                .map(|(vlsn, _)| *vlsn)
                .collect();
            vlsns
                .into_iter()
                .filter_map(|vlsn| awaiting.remove(&vlsn).map(|txn| (vlsn, txn)))
                .collect()
        };

        let timeout_ms = self.config.replica_ack_timeout.as_millis() as u64;
        for (vlsn, txn) in &expired {
            let Some(handler) = txn
                .latch()
                .and_then(|latch| latch.as_async())
                .and_then(|latch| latch.take_handler())
            else {
                continue;
            };
            let required = txn.required_ack_count();
            let error: StorageError = ReplicationError::InsufficientAcks {
                txn_id: txn.txn_id(),
                required,
                received: required.saturating_sub(txn.pending_acks()),
                timeout_ms,
            }
            .into();
            warn!(txn_id = %txn.txn_id(), %vlsn, "async commit timed out waiting for acks");
            handler.on_failure(txn.txn_id(), &error);
        }
        expired.len()
    }

    /// Commits a content-free transaction so that replicas learn the current DTVLSN.
    pub fn log_watermark_txn(self: &Arc<Self>) -> StorageResult<Option<Vlsn>> {
        let txn = WatermarkTxn::begin(self)?;
        txn.commit()?;
        Ok(txn.commit_vlsn())
    }

    /// Takes the block latch in write mode, holding back every commit and abort record until
    /// the returned guard is dropped. Returns `None` on timeout.
    pub fn block_txn_completion(&self, timeout: Duration) -> Option<BlockGuard<'_>> {
        let stamp = self.block_latch.try_write_lock(timeout)?;
        info!("blocked transaction completion");
        Some(BlockGuard {
            latch: &self.block_latch,
            stamp: Some(stamp),
        })
    }

    /// Freezes every open master transaction, and every committed one still blocked waiting
    /// for acks. Returns how many were frozen.
    pub fn freeze_master_txns(&self) -> usize {
        let mut txns: BTreeMap<TxnId, Arc<MasterTxn>> = self
            .master_txns
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for txn in self.awaiting_acks.lock().values() {
            if !txn.is_async_commit() {
                txns.insert(txn.txn_id(), txn.clone());
            }
        }
        for txn in txns.values() {
            txn.freeze();
        }
        info!(count = txns.len(), "froze master transactions");
        txns.len()
    }

    /// Lets frozen master transactions continue after a master transfer was abandoned and
    /// this node stayed master. Returns how many were unfrozen.
    pub fn unfreeze_master_txns(&self) -> usize {
        let mut count = 0;
        for txn in self.active_master_txns() {
            if txn.is_frozen() {
                txn.unfreeze();
                count += 1;
            }
        }
        info!(count, "unfroze master transactions");
        count
    }

    /// Converts every frozen master transaction into a replay transaction. Must run after
    /// the block latch was released, once this node is no longer master.
    pub fn convert_master_txns(&self) -> StorageResult<Vec<Arc<ReplayTxn>>> {
        let mut converted = Vec::new();
        for txn in self.active_master_txns() {
            if !txn.is_frozen() {
                continue;
            }
            if let Some(replay) = txn.convert_and_close()? {
                converted.push(replay);
            }
        }
        info!(count = converted.len(), "converted master transactions");
        Ok(converted)
    }

    pub(crate) fn begin_watermark_txn(self: &Arc<Self>) -> StorageResult<Arc<MasterTxn>> {
        let config = TransactionConfig {
            durability: Some(WatermarkTxn::DURABILITY),
            ..TransactionConfig::default()
        };
        MasterTxn::begin_kind(self, &config, MasterTxnKind::Watermark)
    }
}

/// Write hold on the block latch. Commit and abort records wait until it is dropped.
pub struct BlockGuard<'a> {
    latch: &'a BlockLatch,
    stamp: Option<LatchStamp>,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        if let Some(stamp) = self.stamp.take() {
            self.latch.unlock_write(stamp);
            info!("unblocked transaction completion");
        }
    }
}

use std::sync::Arc;

use repkv_transaction::{
    Durability, Lsn, ReplicaAckPolicy, SyncPolicy, Transaction, TxnId, TxnState, Vlsn,
};

use super::env::RepEnvironment;
use super::master_txn::MasterTxn;
use crate::error::StorageResult;

/// A master transaction that writes nothing but a commit record, used to carry the current
/// DTVLSN to replicas when no application commit does. It never takes a lock.
pub struct WatermarkTxn {
    txn: Arc<MasterTxn>,
}

impl WatermarkTxn {
    /// No local fsync, but a simple majority must see it.
    pub const DURABILITY: Durability = Durability::new(
        SyncPolicy::NoSync,
        SyncPolicy::NoSync,
        ReplicaAckPolicy::SimpleMajority,
    );

    pub fn begin(env: &Arc<RepEnvironment>) -> StorageResult<Self> {
        Ok(Self {
            txn: env.begin_watermark_txn()?,
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn.txn_id()
    }

    pub fn state(&self) -> TxnState {
        self.txn.state()
    }

    pub fn commit(&self) -> StorageResult<Option<Lsn>> {
        self.txn.commit()
    }

    pub fn abort(&self) -> StorageResult<()> {
        self.txn.abort()
    }

    pub fn commit_vlsn(&self) -> Option<Vlsn> {
        self.txn.commit_vlsn()
    }

    pub fn master_txn(&self) -> &Arc<MasterTxn> {
        &self.txn
    }
}

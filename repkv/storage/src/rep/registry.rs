use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use repkv_transaction::{Transaction, TxnId};

use super::replay_txn::ReplayTxn;

/// Replay transactions in progress on a replica, by id.
#[derive(Default)]
pub struct ActiveTxns {
    txns: SkipMap<TxnId, Arc<ReplayTxn>>,
}

impl ActiveTxns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `txn`. Returns false, leaving the registry unchanged, if its id is taken.
    pub fn put(&self, txn: Arc<ReplayTxn>) -> bool {
        let id = txn.txn_id();
        if self.txns.contains_key(&id) {
            return false;
        }
        self.txns.insert(id, txn);
        true
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<ReplayTxn>> {
        self.txns.get(&txn_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, txn_id: TxnId) -> Option<Arc<ReplayTxn>> {
        self.txns.remove(&txn_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.txns.contains_key(&txn_id)
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    /// Snapshot of the registered transactions in id order.
    pub fn txns(&self) -> Vec<Arc<ReplayTxn>> {
        self.txns.iter().map(|entry| entry.value().clone()).collect()
    }
}

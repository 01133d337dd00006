mod common;
use std::thread;
use std::time::Duration;

use common::*;
use repkv_storage::lock::LockType;
use repkv_storage::log::RecordKey;
use repkv_storage::rep::{ReplicatedEntry, ReplicatedTxnEnd, Replayer};
use repkv_storage::{ReplicationError, StorageError, TransactionError};
use repkv_transaction::{MasterIdTerm, Transaction, TransactionConfig, TxnState, Vlsn};

fn key(name: &str) -> RecordKey {
    RecordKey::new(DB, name)
}

#[test]
fn test_convert_hands_locks_to_replay_txn() {
    let node = TestNode::master(1);
    let setup = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    setup.put(key("a"), "old").unwrap();
    setup.commit().unwrap();
    let committed = node.env.core().index().get(&key("a")).unwrap();

    let txn = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    let a = txn.put(key("a"), "new").unwrap();
    let b = txn.put(key("b"), "1").unwrap();
    let id = txn.txn_id();

    assert_eq!(node.env.freeze_master_txns(), 1);
    node.node
        .become_replica(Some(MasterIdTerm::new(2, MASTER_TERM + 1)));
    let converted = node.env.convert_master_txns().unwrap();
    assert_eq!(converted.len(), 1);
    let replay = &converted[0];

    assert_eq!(replay.txn_id(), id);
    let moved: Vec<_> = replay.write_locks().into_iter().map(|(lsn, _)| lsn).collect();
    assert_eq!(moved, vec![a, b]);
    assert_eq!(replay.first_logged_lsn(), Some(a));
    assert_eq!(replay.last_logged_lsn(), Some(b));
    assert_eq!(
        node.env.core().locks().locks_held_by(id),
        vec![(a, LockType::Write), (b, LockType::Write)]
    );

    assert_eq!(txn.state(), TxnState::Closed);
    assert!(txn.write_locks().is_empty());
    assert_eq!(txn.last_logged_lsn(), None);
    assert!(!txn.is_frozen());
    assert!(node.env.master_txn(id).is_none());
    assert!(node.env.replay_registry().contains(id));

    // The new master never saw the transaction and aborts it.
    let replayer = Replayer::new(node.env.clone());
    replayer
        .apply(ReplicatedEntry::Abort {
            txn_id: id,
            end: ReplicatedTxnEnd {
                vlsn: Vlsn::new(100),
                master_id_term: MasterIdTerm::new(2, MASTER_TERM + 1),
                dtvlsn: Vlsn::new(1),
            },
        })
        .unwrap();
    assert!(!node.env.replay_registry().contains(id));
    assert_eq!(node.env.core().index().get(&key("a")), Some(committed));
    assert_eq!(node.env.core().index().get(&key("b")), None);
    assert!(node.env.core().locks().locks_held_by(id).is_empty());
}

#[test]
fn test_converted_txn_cannot_commit() {
    let node = TestNode::master(1);
    let txn = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    txn.put(key("a"), "1").unwrap();
    txn.freeze();
    node.node.become_replica(None);
    let replay = txn.convert_and_close().unwrap().unwrap();

    assert!(matches!(
        txn.commit(),
        Err(StorageError::Transaction(TransactionError::NotOpen(_)))
    ));
    assert!(matches!(
        replay.commit(),
        Err(StorageError::Transaction(TransactionError::Unsupported(_)))
    ));
}

#[test]
fn test_convert_requires_frozen_txn() {
    let node = TestNode::master(1);
    let txn = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    txn.put(key("a"), "1").unwrap();
    assert!(matches!(
        txn.convert_and_close(),
        Err(StorageError::Transaction(TransactionError::IllegalState(_)))
    ));
    txn.commit().unwrap();
}

#[test]
fn test_convert_without_write_locks_keeps_txn_open() {
    let node = TestNode::master(1);
    let setup = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    setup.put(key("a"), "1").unwrap();
    setup.commit().unwrap();

    let reader = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    assert_eq!(reader.get(&key("a")).unwrap(), Some(b"1".to_vec()));
    reader.freeze();
    assert!(reader.convert_and_close().unwrap().is_none());
    assert_eq!(reader.state(), TxnState::Open);
    assert!(!reader.is_frozen());
    assert!(!node.env.replay_registry().contains(reader.txn_id()));
    reader.commit().unwrap();
}

#[test]
fn test_convert_ended_txn_is_noop() {
    let node = TestNode::master(1);
    let txn = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    txn.put(key("a"), "1").unwrap();
    txn.commit().unwrap();
    txn.freeze();
    assert!(txn.convert_and_close().unwrap().is_none());
    assert_eq!(txn.state(), TxnState::Committed);
}

#[test]
fn test_frozen_txn_cannot_lock() {
    let node = TestNode::master(1);
    let txn = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    txn.freeze();
    assert!(matches!(
        txn.put(key("a"), "1"),
        Err(StorageError::Replication(ReplicationError::UnknownMaster { .. }))
    ));
}

#[test]
fn test_transfer_fails_blocked_committer() {
    let mut config = test_config(false);
    config.replica_ack_timeout = Duration::from_secs(10);
    // Two acks required.
    let node = TestNode::master_with_config(5, config);
    let committing = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    committing.put(key("a"), "1").unwrap();
    let open = node.env.begin_master_txn(&TransactionConfig::default()).unwrap();
    open.put(key("b"), "1").unwrap();

    let committer = {
        let txn = committing.clone();
        thread::spawn(move || txn.commit())
    };
    // One of the two acks arrives.
    loop {
        if let Some(vlsn) = committing.commit_vlsn() {
            if node.env.replica_ack(vlsn) {
                break;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(node.env.freeze_master_txns(), 2);
    node.node.become_replica(None);
    let converted = node.env.convert_master_txns().unwrap();
    assert_eq!(converted.len(), 1);
    assert_eq!(converted[0].txn_id(), open.txn_id());

    assert!(committer.join().unwrap().unwrap_err().is_insufficient_acks());
    assert_eq!(committing.state(), TxnState::Committed);
}

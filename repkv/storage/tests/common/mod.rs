#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use repkv_storage::rep::{ElectableGroup, NodeState, RepEnvironment};
use repkv_storage::{EnvCore, LogConfig, RepConfig};
use repkv_transaction::{Durability, ReplicaAckPolicy, SyncPolicy};

pub const MASTER_NODE_ID: u32 = 1;
pub const MASTER_TERM: u64 = 1;
pub const DB: u32 = 1;

pub struct TestCleaner {
    log_path: PathBuf,
}

impl Drop for TestCleaner {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.log_path);
    }
}

pub fn create_test_log_config() -> (LogConfig, TestCleaner) {
    let temp_file = temp_file::TempFileBuilder::new()
        .prefix("test_repkv_log_")
        .suffix(".log")
        .build()
        .unwrap();
    let path = temp_file.path().to_owned();
    temp_file.leak();
    (
        LogConfig {
            log_path: Some(path.clone()),
        },
        TestCleaner { log_path: path },
    )
}

pub fn test_config(group_commit: bool) -> RepConfig {
    RepConfig {
        node_id: MASTER_NODE_ID,
        default_durability: Durability::new(
            SyncPolicy::NoSync,
            SyncPolicy::NoSync,
            ReplicaAckPolicy::SimpleMajority,
        ),
        replica_ack_timeout: Duration::from_secs(5),
        authoritative_timeout: Duration::from_secs(1),
        master_transfer_phase2_timeout: Duration::from_millis(500),
        txn_lock_timeout: Duration::from_millis(200),
        replay_txn_lock_timeout: Duration::from_millis(200),
        group_commit,
        log: LogConfig::default(),
    }
}

/// An in-memory node that is the authoritative master of a group of `group_size`.
pub struct TestNode {
    pub env: Arc<RepEnvironment>,
    pub node: Arc<NodeState>,
    pub group: Arc<ElectableGroup>,
}

impl TestNode {
    pub fn master(group_size: usize) -> Self {
        Self::master_with_config(group_size, test_config(false))
    }

    pub fn master_with_config(group_size: usize, config: RepConfig) -> Self {
        let node = Arc::new(NodeState::new(config.node_id));
        node.become_master(MASTER_TERM);
        node.set_authoritative(true);
        Self::with_node(node, group_size, config)
    }

    pub fn replica(group_size: usize) -> Self {
        let config = test_config(false);
        let node = Arc::new(NodeState::new(config.node_id + 1));
        node.become_replica(None);
        Self::with_node(node, group_size, config)
    }

    fn with_node(node: Arc<NodeState>, group_size: usize, config: RepConfig) -> Self {
        let group = Arc::new(ElectableGroup::new(group_size));
        let core = Arc::new(EnvCore::in_memory());
        core.index().create_database(DB);
        let env = RepEnvironment::new(config, core, node.clone(), node.clone(), group.clone());
        Self { env, node, group }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use repkv_transaction::Durability;

const DEFAULT_NODE_ID: u32 = 1;
const DEFAULT_REPLICA_ACK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_AUTHORITATIVE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MASTER_TRANSFER_PHASE2_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TXN_LOCK_TIMEOUT_MS: u64 = 500;
const DEFAULT_REPLAY_TXN_LOCK_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// File backing the log. `None` keeps the log in memory only.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RepConfig {
    /// Id of this node within the replication group
    pub node_id: u32,

    /// Durability used by master transactions that do not request their own
    pub default_durability: Durability,

    /// How long a committing master transaction waits for replica acks
    pub replica_ack_timeout: Duration,

    /// How long a write transaction waits for the master to become authoritative
    pub authoritative_timeout: Duration,

    /// Phase-2 timeout of a master transfer; the block latch read timeout is derived from it
    pub master_transfer_phase2_timeout: Duration,

    /// Lock timeout of master transactions
    pub txn_lock_timeout: Duration,

    /// Lock timeout of replay transactions (never zero)
    pub replay_txn_lock_timeout: Duration,

    /// Commits are piggy-backed on a group fsync; the master's own ack is then counted
    /// as one of the required acks
    pub group_commit: bool,

    pub log: LogConfig,
}

impl RepConfig {
    /// Bound on acquiring the block latch in read mode while writing a commit or abort record.
    pub fn block_latch_timeout(&self) -> Duration {
        self.master_transfer_phase2_timeout * 2
    }
}

impl Default for RepConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID,
            default_durability: Durability::default(),
            replica_ack_timeout: Duration::from_millis(DEFAULT_REPLICA_ACK_TIMEOUT_MS),
            authoritative_timeout: Duration::from_millis(DEFAULT_AUTHORITATIVE_TIMEOUT_MS),
            master_transfer_phase2_timeout: Duration::from_millis(
                DEFAULT_MASTER_TRANSFER_PHASE2_TIMEOUT_MS,
            ),
            txn_lock_timeout: Duration::from_millis(DEFAULT_TXN_LOCK_TIMEOUT_MS),
            replay_txn_lock_timeout: Duration::from_millis(DEFAULT_REPLAY_TXN_LOCK_TIMEOUT_MS),
            group_commit: false,
            log: LogConfig::default(),
        }
    }
}

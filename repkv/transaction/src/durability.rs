//! Durability and consistency policies requested by transactions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the local node persists a commit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// Write and fsync before the commit returns.
    Sync,
    /// Write to the OS buffers but do not fsync.
    WriteNoSync,
    /// Leave the record in the log buffer.
    NoSync,
}

/// How many replicas must acknowledge a commit before it is considered durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaAckPolicy {
    /// Every electable replica.
    All,
    /// A simple majority of the electable group, counting the master.
    SimpleMajority,
    /// No replica acknowledgment.
    None,
}

/// The durability a transaction asks for, locally and across the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Durability {
    pub local_sync: SyncPolicy,
    pub replica_sync: SyncPolicy,
    pub replica_ack: ReplicaAckPolicy,
}

impl Durability {
    pub const COMMIT_SYNC: Durability = Durability::new(
        SyncPolicy::Sync,
        SyncPolicy::NoSync,
        ReplicaAckPolicy::SimpleMajority,
    );

    pub const COMMIT_NO_SYNC: Durability = Durability::new(
        SyncPolicy::NoSync,
        SyncPolicy::NoSync,
        ReplicaAckPolicy::SimpleMajority,
    );

    /// Durability used by a replica when writing a replayed record: no ack is ever requested.
    pub const fn replay(local_sync: SyncPolicy) -> Durability {
        Durability::new(local_sync, SyncPolicy::NoSync, ReplicaAckPolicy::None)
    }

    pub const fn new(
        local_sync: SyncPolicy,
        replica_sync: SyncPolicy,
        replica_ack: ReplicaAckPolicy,
    ) -> Self {
        Self {
            local_sync,
            replica_sync,
            replica_ack,
        }
    }
}

impl Default for Durability {
    fn default() -> Self {
        Self::COMMIT_SYNC
    }
}

/// Read consistency requested by a transaction running on a replication node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsistencyPolicy {
    #[default]
    NoConsistency,
    /// Reads must reflect every commit the master has made. Only meaningful for readers.
    Absolute,
}

/// Per-transaction settings.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// Overrides the environment's default durability when set.
    pub durability: Option<Durability>,
    pub consistency: ConsistencyPolicy,
    pub read_only: bool,
    /// Overrides the environment's lock timeout when set.
    pub lock_timeout: Option<Duration>,
}

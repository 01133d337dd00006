//! Replication-aware transactions: master commits with quorum acks, replica replay with
//! rollback, and the conversion of master transactions when the node loses mastership.

pub mod block_latch;
pub mod env;
pub mod latch;
pub mod master_txn;
pub mod null_txn;
pub mod quorum;
pub mod registry;
pub mod replay;
pub mod replay_txn;
pub mod role;
pub mod txn_chain;

pub use block_latch::{BlockLatch, LatchStamp};
pub use env::{BlockGuard, RepEnvironment};
pub use latch::{AckLatch, AsyncAckHandler, AsyncLatch, QuorumLatch, WaiterLatch};
pub use master_txn::MasterTxn;
pub use null_txn::WatermarkTxn;
pub use quorum::{ElectableGroup, QuorumPolicy};
pub use registry::ActiveTxns;
pub use replay::{ReplicatedEntry, Replayer};
pub use replay_txn::{ReplayTxn, ReplicatedTxnEnd};
pub use role::{AuthoritativeGate, MasterTermAccessor, NodeState, ReplicaRole, RoleSource};
pub use txn_chain::{RevertTo, TxnChain};

//! Transaction core of a replicated, log-structured key-value store.
//!
//! Every change is appended to a [`log::RepLog`] and becomes visible through the in-memory
//! index once logged. On the master, [`rep::MasterTxn`] commits wait for replica acks; on a
//! replica, [`rep::ReplayTxn`] reproduces the master's transactions and can be rolled back
//! to a matchpoint when the replica's log diverged.

pub mod config;
pub mod env;
pub mod error;
pub mod index;
pub mod lock;
pub mod log;
pub mod rep;
pub mod txn;

pub use config::{LogConfig, RepConfig};
pub use env::EnvCore;
pub use error::{
    EnvironmentFailure, FailureReason, LockError, LogError, ReplicationError, StorageError,
    StorageResult, TransactionError,
};

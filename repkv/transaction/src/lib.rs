//! Common transaction infrastructure for the repkv storage engine.
//!
//! This crate provides the identifiers, log coordinates and policy types that are shared by
//! the master-side and replica-side transaction implementations.

pub mod durability;
pub mod error;
pub mod ids;
pub mod transaction;

pub use durability::{
    ConsistencyPolicy, Durability, ReplicaAckPolicy, SyncPolicy, TransactionConfig,
};
pub use error::IdError;
pub use ids::{Lsn, MasterIdTerm, TransactionIdGenerator, TxnId, Vlsn};
pub use transaction::{Transaction, TxnState};

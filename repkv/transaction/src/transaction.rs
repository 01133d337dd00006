//! Transaction trait and related functionality
//!
//! This module defines the core transaction interface shared by the master-side and
//! replica-side transaction kinds.

use serde::{Deserialize, Serialize};

use crate::ids::{Lsn, TxnId};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Open,
    /// Open, but may only be aborted.
    MustAbort,
    Committed,
    Aborted,
    /// Closed without a commit or abort record, e.g. after its locks were handed to another
    /// transaction.
    Closed,
}

impl TxnState {
    /// Returns true while the transaction may still do work.
    pub fn is_open(&self) -> bool {
        matches!(self, TxnState::Open | TxnState::MustAbort)
    }
}

/// Trait defining the core operations that all transactions must support.
pub trait Transaction: Send + Sync {
    /// The error type for transaction operations
    type Error;

    /// Get the transaction ID
    fn txn_id(&self) -> TxnId;

    /// Get the current lifecycle state
    fn state(&self) -> TxnState;

    /// Returns true if the transaction's records are shipped to, or came from, other nodes.
    fn is_replicated(&self) -> bool {
        self.txn_id().is_replicated()
    }

    /// Commit the transaction, returning the LSN of the commit record if one was written
    fn commit(&self) -> Result<Option<Lsn>, Self::Error>;

    /// Abort the transaction and undo all changes
    fn abort(&self) -> Result<(), Self::Error>;
}

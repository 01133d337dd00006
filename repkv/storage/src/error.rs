use repkv_transaction::{IdError, Lsn, MasterIdTerm, TxnId};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Log error: {0}")]
    Log(#[from] LogError),
    #[error("Environment failure: {0}")]
    EnvironmentFailure(#[from] EnvironmentFailure),
    #[error("Thread interrupted: {0}")]
    ThreadInterrupted(String),
}

impl StorageError {
    /// Returns true if the error invalidated the environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::EnvironmentFailure(_))
    }

    pub fn is_insufficient_acks(&self) -> bool {
        matches!(
            self,
            StorageError::Replication(ReplicationError::InsufficientAcks { .. })
        )
    }

    /// Errors raised after a commit record is durable are normally logged and dropped. These
    /// are the ones the caller must still see.
    pub(crate) fn propagates_after_commit(&self) -> bool {
        self.is_fatal()
            || self.is_insufficient_acks()
            || matches!(self, StorageError::ThreadInterrupted(_))
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction id error: {0}")]
    Id(#[from] IdError),
    #[error("Transaction {0} is not open")]
    NotOpen(TxnId),
    #[error("Transaction {0} may only be aborted")]
    MustAbort(TxnId),
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Transaction {txn_id} cannot write on a replica (current master: {master:?})")]
    ReplicaWrite {
        txn_id: TxnId,
        master: Option<MasterIdTerm>,
    },
    #[error("Transaction {txn_id} cannot write: the master is unknown")]
    UnknownMaster { txn_id: TxnId },
    #[error(
        "Transaction {txn_id} received {received} of {required} required acks within {timeout_ms}ms"
    )]
    InsufficientAcks {
        txn_id: TxnId,
        required: usize,
        received: usize,
        timeout_ms: u64,
    },
    #[error("Master did not become authoritative for transaction {txn_id} within {timeout_ms}ms")]
    NotAuthoritative { txn_id: TxnId, timeout_ms: u64 },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock on {lsn} timed out for transaction {txn_id} after {timeout_ms}ms")]
    Timeout {
        lsn: Lsn,
        txn_id: TxnId,
        timeout_ms: u64,
    },
    #[error("Locks of transaction {txn_id} were preempted by a replay transaction")]
    Preempted { txn_id: TxnId },
    #[error("Lock on {lsn} denied to transaction {txn_id}")]
    Denied { lsn: Lsn, txn_id: TxnId },
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("No log entry at {0}")]
    EntryNotFound(Lsn),
}

/// A violated protocol invariant. Once raised, the environment that raised it is invalid and
/// must be reopened to run recovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason:?}: {message}")]
pub struct EnvironmentFailure {
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Internal state contradicts what the protocol guarantees.
    UnexpectedState,
    /// A fatal failure was reported earlier; the environment is no longer usable.
    EnvironmentInvalid,
    /// A record was appended but could not be made durable.
    LogWrite,
}

impl EnvironmentFailure {
    pub fn unexpected_state(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::UnexpectedState,
            message: message.into(),
        }
    }

    pub fn log_write(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::LogWrite,
            message: message.into(),
        }
    }
}

/// Returned by blocking collaborators whose wait was interrupted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait interrupted")]
pub struct Interrupted;

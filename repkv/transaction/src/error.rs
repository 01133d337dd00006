use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("expected a replicated txn-id, but got a local one ({0})")]
    WrongDomainReplicated(i64),

    #[error("expected a local txn-id, but got a replicated one ({0})")]
    WrongDomainLocal(i64),

    #[error("replicated txn-id overflow, reached {0}")]
    ReplicatedIdOverflow(i64),

    #[error("local txn-id overflow, reached {0}")]
    LocalIdOverflow(i64),
}

mod base;

pub use base::{PendingDbOp, Txn, TxnInner};
pub(crate) use base::TxnHooks;

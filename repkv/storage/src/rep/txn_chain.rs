//! Per-record revert chain of a replay transaction, rebuilt for partial rollback.
//!
//! Every logged record only remembers the version its key had before the transaction first
//! touched it. Rolling back part of a transaction needs the version each record replaced,
//! which is the previous record of the same key in the same transaction, if any.

use std::collections::HashMap;

use repkv_transaction::Lsn;

use crate::error::StorageResult;
use crate::log::{LogBody, RecordKey, RepLog};

/// Version a rolled-back record reverts its key to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertTo {
    pub lsn: Option<Lsn>,
    pub known_deleted: bool,
}

#[derive(Debug, Default)]
pub struct TxnChain {
    reverts: HashMap<Lsn, RevertTo>,
}

impl TxnChain {
    /// Walks the transaction's records from `last_lsn` towards older ones until every record
    /// after `matchpoint` has a known revert target.
    pub fn build(log: &RepLog, last_lsn: Lsn, matchpoint: Lsn) -> StorageResult<Self> {
        let mut reverts = HashMap::new();
        // Newest record of each key seen so far whose predecessor is still unknown, with the
        // first-version revert target it falls back to.
        let mut unresolved: HashMap<RecordKey, (Lsn, RevertTo)> = HashMap::new();
        let mut unresolved_after_matchpoint = 0usize;

        let mut cursor = Some(last_lsn);
        while let Some(lsn) = cursor {
            let entry = log.fetch(lsn)?;
            if let LogBody::Ln(ln) = &entry.body {
                if let Some((newer, _)) = unresolved.remove(&ln.key) {
                    reverts.insert(
                        newer,
                        RevertTo {
                            lsn: Some(lsn),
                            known_deleted: ln.data.is_none(),
                        },
                    );
                    if newer > matchpoint {
                        unresolved_after_matchpoint -= 1;
                    }
                }
                unresolved.insert(
                    ln.key.clone(),
                    (
                        lsn,
                        RevertTo {
                            lsn: ln.abort_lsn,
                            known_deleted: ln.abort_known_deleted,
                        },
                    ),
                );
                if lsn > matchpoint {
                    unresolved_after_matchpoint += 1;
                }
            }
            if lsn <= matchpoint && unresolved_after_matchpoint == 0 {
                break;
            }
            cursor = entry.prev_lsn();
        }

        for (_, (lsn, fallback)) in unresolved {
            reverts.insert(lsn, fallback);
        }
        Ok(Self { reverts })
    }

    pub fn revert_for(&self, lsn: Lsn) -> Option<RevertTo> {
        self.reverts.get(&lsn).copied()
    }
}

#[cfg(test)]
mod tests {
    use repkv_transaction::TxnId;

    use super::*;
    use crate::log::{LnRecord, VlsnSource};

    struct Writer {
        log: RepLog,
        prev: Option<Lsn>,
    }

    impl Writer {
        fn write(&mut self, key: &str, data: Option<&str>, abort_lsn: Option<Lsn>) -> Lsn {
            let entry = self
                .log
                .append(
                    TxnId::new(-1),
                    VlsnSource::Local,
                    LogBody::Ln(LnRecord {
                        key: RecordKey::new(1, key),
                        data: data.map(|d| d.as_bytes().to_vec()),
                        abort_lsn,
                        abort_known_deleted: abort_lsn.is_none(),
                        prev_lsn: self.prev,
                    }),
                )
                .unwrap();
            self.prev = Some(entry.lsn);
            entry.lsn
        }
    }

    #[test]
    fn test_same_key_chain() {
        let mut w = Writer {
            log: RepLog::in_memory(),
            prev: None,
        };
        let committed = Lsn::new(9999);
        let a1 = w.write("a", Some("1"), Some(committed));
        let b1 = w.write("b", Some("1"), None);
        let a2 = w.write("a", None, Some(committed));
        let a3 = w.write("a", Some("3"), Some(committed));

        let chain = TxnChain::build(&w.log, a3, a1).unwrap();
        assert_eq!(
            chain.revert_for(a3),
            Some(RevertTo {
                lsn: Some(a2),
                known_deleted: true
            })
        );
        assert_eq!(
            chain.revert_for(a2),
            Some(RevertTo {
                lsn: Some(a1),
                known_deleted: false
            })
        );
        // First write of a key in the transaction reverts to its abort info.
        assert_eq!(
            chain.revert_for(b1),
            Some(RevertTo {
                lsn: None,
                known_deleted: true
            })
        );
    }

    #[test]
    fn test_walk_stops_once_resolved() {
        let mut w = Writer {
            log: RepLog::in_memory(),
            prev: None,
        };
        let a1 = w.write("a", Some("1"), None);
        let b1 = w.write("b", Some("1"), None);
        let b2 = w.write("b", Some("2"), None);

        let chain = TxnChain::build(&w.log, b2, b1).unwrap();
        assert_eq!(chain.revert_for(b2).unwrap().lsn, Some(b1));
        // `a1` lies before the matchpoint and never had to be visited.
        assert_eq!(chain.revert_for(a1), None);
    }
}

//! Identifiers and log coordinates for replicated transactions
//!
//! This module provides transaction id generation and the position types (LSN, VLSN) and
//! master-term tags that every commit or abort record carries.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Identifies a transaction.
///
/// Transactions that originate on a master and are shipped to replicas use the negative id
/// space, growing away from zero. Node-local transactions use the positive id space. A replay
/// transaction always reuses the id found in the replicated record, so the two spaces never
/// collide as long as a node advances its replicated counter past every id it replays.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxnId(i64);

impl TxnId {
    /// Create a transaction id from its raw value.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value of the id.
    pub fn raw(&self) -> i64 {
        self.0
    }

    /// Returns true if the id belongs to the replicated (master-generated) id space.
    pub fn is_replicated(&self) -> bool {
        self.0 < 0
    }

    /// Returns true if the id belongs to the node-local id space.
    pub fn is_local(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates transaction ids for both id spaces.
pub struct TransactionIdGenerator {
    /// Last replicated id handed out or observed. Replicated ids decrease.
    last_replicated: AtomicI64,
    /// Last local id handed out. Local ids increase.
    last_local: AtomicI64,
}

impl TransactionIdGenerator {
    /// Create a new generator with both counters at zero.
    pub fn new() -> Self {
        Self::with_start(0, 0)
    }

    /// Create a generator that continues after the given last-used ids.
    pub fn with_start(last_replicated: i64, last_local: i64) -> Self {
        Self {
            last_replicated: AtomicI64::new(last_replicated.min(0)),
            last_local: AtomicI64::new(last_local.max(0)),
        }
    }

    /// Generate the next replicated (master-side) transaction id.
    pub fn next_replicated(&self) -> Result<TxnId, IdError> {
        let mut cur = self.last_replicated.load(Ordering::SeqCst);
        loop {
            if cur == i64::MIN {
                return Err(IdError::ReplicatedIdOverflow(cur));
            }
            match self.last_replicated.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(TxnId(cur - 1)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Generate the next node-local transaction id.
    pub fn next_local(&self) -> Result<TxnId, IdError> {
        let mut cur = self.last_local.load(Ordering::SeqCst);
        loop {
            if cur == i64::MAX {
                return Err(IdError::LocalIdOverflow(cur));
            }
            match self.last_local.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(TxnId(cur + 1)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Record a replicated id seen in the replication stream, so that ids generated after this
    /// node becomes master never reuse it.
    pub fn update_replicated(&self, txn_id: TxnId) -> Result<(), IdError> {
        if !txn_id.is_replicated() {
            return Err(IdError::WrongDomainReplicated(txn_id.raw()));
        }
        self.last_replicated
            .fetch_min(txn_id.raw(), Ordering::SeqCst);
        Ok(())
    }

    /// Returns the last replicated id handed out or observed.
    pub fn last_replicated(&self) -> TxnId {
        TxnId(self.last_replicated.load(Ordering::SeqCst))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical position of a record in the log: the byte offset of its frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(u64);

impl Lsn {
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Logical position of a record in the replication stream.
///
/// Real positions start at [`Vlsn::FIRST`]. Two sentinels sort below every real position:
/// [`Vlsn::NULL`] (no position at all) and [`Vlsn::UNINITIALIZED`] (a position that will be
/// filled in later, e.g. the DTVLSN a master leaves for the log to correct).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Vlsn(i64);

impl Vlsn {
    pub const NULL: Vlsn = Vlsn(-1);
    pub const UNINITIALIZED: Vlsn = Vlsn(0);
    pub const FIRST: Vlsn = Vlsn(1);

    pub const fn new(sequence: i64) -> Self {
        Self(sequence)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Returns true for a real stream position (neither sentinel).
    pub fn is_real(&self) -> bool {
        self.0 >= Self::FIRST.0
    }

    pub fn next(&self) -> Vlsn {
        Vlsn(self.0.max(0) + 1)
    }
}

impl fmt::Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(master id, master term)` pair embedded in every commit and abort record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterIdTerm {
    node_id: u32,
    term: u64,
}

impl MasterIdTerm {
    /// Used when no term has ever been held by this node.
    pub const PRIMORDIAL: MasterIdTerm = MasterIdTerm {
        node_id: 0,
        term: 0,
    };

    pub const fn new(node_id: u32, term: u64) -> Self {
        Self { node_id, term }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Returns true if a record tagged with `self` may legitimately be followed by one tagged
    /// with `other`: either the term advanced, or the term is unchanged and so is its master.
    pub fn precedes(&self, other: &MasterIdTerm) -> bool {
        self.term < other.term || (self.term == other.term && self.node_id == other.node_id)
    }
}

impl fmt::Display for MasterIdTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_domains() {
        let replicated = TxnId::new(-7);
        assert!(replicated.is_replicated());
        assert!(!replicated.is_local());

        let local = TxnId::new(7);
        assert!(local.is_local());
        assert!(!local.is_replicated());
    }

    #[test]
    fn test_replicated_ids_move_away_from_zero() {
        let generator = TransactionIdGenerator::new();
        let t1 = generator.next_replicated().unwrap();
        let t2 = generator.next_replicated().unwrap();
        assert_eq!(t1.raw(), -1);
        assert_eq!(t2.raw(), -2);
        assert!(t1.is_replicated() && t2.is_replicated());

        let l1 = generator.next_local().unwrap();
        assert_eq!(l1.raw(), 1);
    }

    #[test]
    fn test_update_replicated() {
        let generator = TransactionIdGenerator::new();
        generator.update_replicated(TxnId::new(-100)).unwrap();
        assert_eq!(generator.next_replicated().unwrap().raw(), -101);

        // An older id must not move the counter back.
        generator.update_replicated(TxnId::new(-5)).unwrap();
        assert_eq!(generator.next_replicated().unwrap().raw(), -102);

        assert_eq!(
            generator.update_replicated(TxnId::new(3)),
            Err(IdError::WrongDomainReplicated(3))
        );
    }

    #[test]
    fn test_replicated_overflow() {
        let generator = TransactionIdGenerator::with_start(i64::MIN, 0);
        assert_eq!(
            generator.next_replicated(),
            Err(IdError::ReplicatedIdOverflow(i64::MIN))
        );
    }

    #[test]
    fn test_vlsn_sentinels_sort_first() {
        assert!(Vlsn::NULL < Vlsn::UNINITIALIZED);
        assert!(Vlsn::UNINITIALIZED < Vlsn::FIRST);
        assert!(!Vlsn::UNINITIALIZED.is_real());
        assert!(Vlsn::FIRST.is_real());
        assert_eq!(Vlsn::NULL.next(), Vlsn::FIRST);
        assert_eq!(Vlsn::new(41).next(), Vlsn::new(42));
    }

    #[test]
    fn test_master_term_precedes() {
        let a = MasterIdTerm::new(1, 5);
        let b = MasterIdTerm::new(2, 6);
        let c = MasterIdTerm::new(3, 5);

        assert!(a.precedes(&a));
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
        // Same term, different master: the log would be contradictory.
        assert!(!a.precedes(&c));
        assert!(MasterIdTerm::PRIMORDIAL.precedes(&a));
    }
}

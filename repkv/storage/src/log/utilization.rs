use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use repkv_transaction::Lsn;

/// How an obsolete entry is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Duplicate-free: counting the same position twice has no effect.
    Exact,
    /// Every call counts, duplicates included.
    Inexact,
}

/// Tracks log entries that no longer hold live data.
#[derive(Debug, Default)]
pub struct ObsoleteTracker {
    exact: DashSet<Lsn>,
    inexact: AtomicU64,
}

impl ObsoleteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `lsn` as obsolete. Returns false only for an exact count of a position that was
    /// already counted exactly.
    pub fn count(&self, lsn: Lsn, mode: CountMode) -> bool {
        match mode {
            CountMode::Exact => self.exact.insert(lsn),
            CountMode::Inexact => {
                self.inexact.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    pub fn is_counted_exact(&self, lsn: Lsn) -> bool {
        self.exact.contains(&lsn)
    }

    pub fn exact_count(&self) -> u64 {
        self.exact.len() as u64
    }

    pub fn inexact_count(&self) -> u64 {
        self.inexact.load(Ordering::Relaxed)
    }

    /// Total obsolete entries, possibly counting rolled-back entries more than once.
    pub fn obsolete_count(&self) -> u64 {
        self.exact_count() + self.inexact_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_counting_ignores_duplicates() {
        let tracker = ObsoleteTracker::new();
        assert!(tracker.count(Lsn::new(10), CountMode::Exact));
        assert!(!tracker.count(Lsn::new(10), CountMode::Exact));
        assert_eq!(tracker.exact_count(), 1);
        assert!(tracker.is_counted_exact(Lsn::new(10)));
    }

    #[test]
    fn test_inexact_counting_tolerates_duplicates() {
        let tracker = ObsoleteTracker::new();
        tracker.count(Lsn::new(10), CountMode::Inexact);
        tracker.count(Lsn::new(10), CountMode::Inexact);
        tracker.count(Lsn::new(10), CountMode::Exact);
        assert_eq!(tracker.inexact_count(), 2);
        assert_eq!(tracker.obsolete_count(), 3);
    }
}

use dashmap::{DashMap, DashSet};
use repkv_transaction::Lsn;

use crate::log::{DbId, RecordKey};

/// Where the current version of a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSlot {
    pub lsn: Lsn,
    /// The version at `lsn` is a deletion.
    pub known_deleted: bool,
}

/// In-memory index from record keys to their latest version, plus the set of open databases.
#[derive(Debug, Default)]
pub struct MemIndex {
    slots: DashMap<RecordKey, IndexSlot>,
    databases: DashSet<DbId>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<IndexSlot> {
        self.slots.get(key).map(|slot| *slot)
    }

    /// Points `key` at a new version, returning the slot it replaced.
    pub fn put(&self, key: RecordKey, slot: IndexSlot) -> Option<IndexSlot> {
        self.slots.insert(key, slot)
    }

    /// Reverts `key` to an earlier version, but only while its slot still points at
    /// `expected`. Reverting to `None` removes the slot. Returns true if the slot changed.
    pub fn revert(
        &self,
        key: &RecordKey,
        expected: Lsn,
        revert_to: Option<Lsn>,
        known_deleted: bool,
    ) -> bool {
        match revert_to {
            Some(lsn) => match self.slots.get_mut(key) {
                Some(mut slot) if slot.lsn == expected => {
                    *slot = IndexSlot { lsn, known_deleted };
                    true
                }
                _ => false,
            },
            None => self
                .slots
                .remove_if(key, |_, slot| slot.lsn == expected)
                .is_some(),
        }
    }

    /// Number of keys with a slot, deleted versions included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if the database did not exist yet.
    pub fn create_database(&self, db_id: DbId) -> bool {
        self.databases.insert(db_id)
    }

    /// Drops a database together with every slot it owns.
    pub fn drop_database(&self, db_id: DbId) -> bool {
        self.slots.retain(|key, _| key.db_id != db_id);
        self.databases.remove(&db_id).is_some()
    }

    pub fn has_database(&self, db_id: DbId) -> bool {
        self.databases.contains(&db_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(lsn: u64) -> IndexSlot {
        IndexSlot {
            lsn: Lsn::new(lsn),
            known_deleted: false,
        }
    }

    #[test]
    fn test_revert_only_from_expected_version() {
        let index = MemIndex::new();
        let key = RecordKey::new(1, "k");
        index.put(key.clone(), slot(200));

        assert!(!index.revert(&key, Lsn::new(100), Some(Lsn::new(50)), false));
        assert_eq!(index.get(&key), Some(slot(200)));

        assert!(index.revert(&key, Lsn::new(200), Some(Lsn::new(100)), true));
        assert_eq!(
            index.get(&key),
            Some(IndexSlot {
                lsn: Lsn::new(100),
                known_deleted: true
            })
        );

        assert!(index.revert(&key, Lsn::new(100), None, true));
        assert_eq!(index.get(&key), None);
    }

    #[test]
    fn test_drop_database_removes_its_keys() {
        let index = MemIndex::new();
        assert!(index.create_database(1));
        assert!(!index.create_database(1));
        index.create_database(2);
        index.put(RecordKey::new(1, "a"), slot(10));
        index.put(RecordKey::new(2, "b"), slot(20));

        assert!(index.drop_database(1));
        assert!(!index.has_database(1));
        assert_eq!(index.len(), 1);
        assert!(index.get(&RecordKey::new(2, "b")).is_some());
    }
}

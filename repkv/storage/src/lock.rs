//! Record lock manager.
//!
//! Locks are taken on log positions: the LSN of the record version being read or replaced.
//! A single mutex guards the owner table and waiters park on one condition variable that is
//! signalled whenever a lock is released.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use repkv_transaction::{Lsn, TxnId};
use tracing::debug;

use crate::error::LockError;
use crate::log::RecordKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    fn conflicts_with(self, other: LockType) -> bool {
        matches!(self, LockType::Write) || matches!(other, LockType::Write)
    }
}

/// What to do when a lock cannot be granted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    NoWait,
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// The lock was not held before.
    New,
    /// The requester already held a lock at least as strong.
    Existing,
    /// A read lock held by the requester was upgraded to a write lock.
    Promotion,
    /// A non-blocking request found a conflicting owner.
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub txn_id: TxnId,
    pub lock_type: LockType,
}

/// Provenance of a write lock held by a transaction on a position it logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLockInfo {
    pub lock_type: LockType,
    /// Record written at the locked position. `None` for database-level records.
    pub key: Option<RecordKey>,
    /// Version of the record before the owning transaction first touched it.
    pub abort_lsn: Option<Lsn>,
    pub abort_known_deleted: bool,
    /// The record did not exist before the owning transaction wrote it.
    pub created_this_txn: bool,
}

impl WriteLockInfo {
    pub fn for_database() -> Self {
        Self {
            lock_type: LockType::Write,
            key: None,
            abort_lsn: None,
            abort_known_deleted: true,
            created_this_txn: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<Lsn, Vec<LockOwner>>>,
    released: Condvar,
    /// Transactions that lost a lock to an importunate requester.
    preempted: DashSet<TxnId>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a lock on `lsn`.
    ///
    /// An importunate request never waits on a conflicting owner: the owner is evicted and
    /// remembered as preempted, so that it fails the next time it checks.
    pub fn lock(
        &self,
        lsn: Lsn,
        txn_id: TxnId,
        lock_type: LockType,
        wait: LockWait,
        importunate: bool,
    ) -> Result<LockGrant, LockError> {
        let deadline = match wait {
            LockWait::NoWait => None,
            LockWait::Timeout(timeout) => Some((Instant::now().checked_add(timeout), timeout)),
        };
        let mut table = self.table.lock();
        let mut timed_out = false;
        loop {
            let owners = table.entry(lsn).or_default();
            match owners.iter().position(|o| o.txn_id == txn_id) {
                Some(pos) => {
                    if owners[pos].lock_type == LockType::Write || lock_type == LockType::Read {
                        return Ok(LockGrant::Existing);
                    }
                    if owners.len() == 1 {
                        owners[pos].lock_type = LockType::Write;
                        return Ok(LockGrant::Promotion);
                    }
                }
                None => {
                    if !owners.iter().any(|o| o.lock_type.conflicts_with(lock_type)) {
                        owners.push(LockOwner { txn_id, lock_type });
                        return Ok(LockGrant::New);
                    }
                }
            }

            if importunate {
                owners.retain(|owner| {
                    if owner.txn_id == txn_id {
                        return true;
                    }
                    debug!(%lsn, victim = %owner.txn_id, by = %txn_id, "lock preempted");
                    self.preempted.insert(owner.txn_id);
                    false
                });
                continue;
            }

            let Some((deadline, timeout)) = deadline else {
                return Ok(LockGrant::Denied);
            };
            if timed_out {
                return Err(LockError::Timeout {
                    lsn,
                    txn_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            timed_out = wait_deadline(&self.released, &mut table, deadline);
        }
    }

    /// Hands the lock on `lsn` from `from` to `to` in a single step. If `from` does not hold
    /// it, `to` is granted the lock only when nobody else conflicts.
    pub fn steal(
        &self,
        lsn: Lsn,
        from: TxnId,
        to: TxnId,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        let mut table = self.table.lock();
        let owners = table.entry(lsn).or_default();
        if let Some(owner) = owners.iter_mut().find(|o| o.txn_id == from) {
            owner.txn_id = to;
            owner.lock_type = lock_type;
            return Ok(());
        }
        if owners
            .iter()
            .any(|o| o.txn_id != to && o.lock_type.conflicts_with(lock_type))
        {
            return Err(LockError::Denied { lsn, txn_id: to });
        }
        owners.retain(|o| o.txn_id != to);
        owners.push(LockOwner {
            txn_id: to,
            lock_type,
        });
        Ok(())
    }

    /// Releases the lock `txn_id` holds on `lsn`. Returns false if it held none.
    pub fn release(&self, lsn: Lsn, txn_id: TxnId) -> bool {
        let mut table = self.table.lock();
        let Some(owners) = table.get_mut(&lsn) else {
            return false;
        };
        let before = owners.len();
        owners.retain(|o| o.txn_id != txn_id);
        let released = owners.len() != before;
        if owners.is_empty() {
            table.remove(&lsn);
        }
        drop(table);
        if released {
            self.released.notify_all();
        }
        released
    }

    /// Releases every lock held by `txn_id`, returning how many were released.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut table = self.table.lock();
        let mut released = 0;
        table.retain(|_, owners| {
            let before = owners.len();
            owners.retain(|o| o.txn_id != txn_id);
            released += before - owners.len();
            !owners.is_empty()
        });
        drop(table);
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    pub fn owners(&self, lsn: Lsn) -> Vec<LockOwner> {
        self.table.lock().get(&lsn).cloned().unwrap_or_default()
    }

    /// Returns the type of lock `txn_id` holds on `lsn`, if any.
    pub fn holds(&self, lsn: Lsn, txn_id: TxnId) -> Option<LockType> {
        self.table
            .lock()
            .get(&lsn)
            .and_then(|owners| owners.iter().find(|o| o.txn_id == txn_id))
            .map(|o| o.lock_type)
    }

    /// Every position `txn_id` holds a lock on, in ascending order.
    pub fn locks_held_by(&self, txn_id: TxnId) -> Vec<(Lsn, LockType)> {
        let table = self.table.lock();
        let mut held: Vec<_> = table
            .iter()
            .filter_map(|(lsn, owners)| {
                owners
                    .iter()
                    .find(|o| o.txn_id == txn_id)
                    .map(|o| (*lsn, o.lock_type))
            })
            .collect();
        held.sort_by_key(|(lsn, _)| *lsn);
        held
    }

    pub fn is_preempted(&self, txn_id: TxnId) -> bool {
        self.preempted.contains(&txn_id)
    }

    pub fn clear_preempted(&self, txn_id: TxnId) {
        self.preempted.remove(&txn_id);
    }
}

/// Waits on `cond` until notified or `deadline` passes. A deadline too far out to represent
/// waits without one. Returns true on timeout.
pub(crate) fn wait_deadline<T: ?Sized>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => cond.wait_until(guard, deadline).timed_out(),
        None => {
            cond.wait(guard);
            false
        }
    }
}

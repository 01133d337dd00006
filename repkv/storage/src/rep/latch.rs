//! Quorum latches: count replica acks for a committing master transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use repkv_transaction::{TxnId, Vlsn};

use crate::error::StorageError;
use crate::lock::wait_deadline;

/// Notified, instead of a blocked thread, when an async commit is acknowledged or fails.
pub trait AsyncAckHandler: Send + Sync {
    fn on_quorum(&self, txn_id: TxnId, commit_vlsn: Vlsn);

    fn on_failure(&self, txn_id: TxnId, error: &StorageError);
}

pub trait AckLatch: Send + Sync {
    fn count_down(&self);

    /// Acks still missing. Never negative.
    fn count(&self) -> usize;

    /// Waits until every ack arrived or `timeout` elapsed. Gives up early, returning false,
    /// as soon as `abandon` answers true after a wake-up.
    fn await_with_timeout(&self, timeout: Duration, abandon: &dyn Fn() -> bool) -> bool;
}

#[derive(Debug)]
struct WaiterState {
    count: usize,
    /// Waiters were released without the acks arriving.
    released: bool,
}

/// Latch that threads block on.
#[derive(Debug)]
pub struct WaiterLatch {
    state: Mutex<WaiterState>,
    cond: Condvar,
    /// Wake every waiter on zero rather than one.
    broadcast: bool,
}

impl WaiterLatch {
    fn new(count: usize, broadcast: bool) -> Self {
        Self {
            state: Mutex::new(WaiterState {
                count,
                released: false,
            }),
            cond: Condvar::new(),
            broadcast,
        }
    }

    fn notify(&self) {
        if self.broadcast {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    /// Drives the count to zero so that waiters return, reporting failure.
    fn release(&self) {
        let mut state = self.state.lock();
        state.count = 0;
        state.released = true;
        drop(state);
        self.cond.notify_all();
    }

    fn wake(&self) {
        // Taking the mutex orders the wake-up after any waiter's last check.
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

impl AckLatch for WaiterLatch {
    fn count_down(&self) {
        let mut state = self.state.lock();
        if state.count == 0 {
            return;
        }
        state.count -= 1;
        if state.count == 0 {
            drop(state);
            self.notify();
        }
    }

    fn count(&self) -> usize {
        self.state.lock().count
    }

    fn await_with_timeout(&self, timeout: Duration, abandon: &dyn Fn() -> bool) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.released {
                return false;
            }
            if state.count == 0 {
                return true;
            }
            if abandon() {
                return false;
            }
            if wait_deadline(&self.cond, &mut state, deadline) {
                return state.count == 0 && !state.released;
            }
        }
    }
}

/// Latch for commits whose outcome is delivered to an [`AsyncAckHandler`]. Nobody blocks on
/// it; extra acks after quorum drive the raw count negative.
pub struct AsyncLatch {
    count: AtomicI64,
    handler: Mutex<Option<Arc<dyn AsyncAckHandler>>>,
}

impl AsyncLatch {
    fn new(count: usize, handler: Arc<dyn AsyncAckHandler>) -> Self {
        Self {
            count: AtomicI64::new(count as i64),
            handler: Mutex::new(Some(handler)),
        }
    }

    /// Hands out the handler exactly once.
    pub fn take_handler(&self) -> Option<Arc<dyn AsyncAckHandler>> {
        self.handler.lock().take()
    }

    pub fn raw_count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl AckLatch for AsyncLatch {
    fn count_down(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst).max(0) as usize
    }

    fn await_with_timeout(&self, _timeout: Duration, _abandon: &dyn Fn() -> bool) -> bool {
        self.count() == 0
    }
}

/// The latch a committing master transaction allocates, chosen by its required ack count.
pub enum QuorumLatch {
    /// No acks required.
    None,
    /// Exactly one required ack and one waiting thread.
    Single(WaiterLatch),
    /// Several required acks, any number of waiting threads.
    Multi(WaiterLatch),
    /// The outcome goes to a handler.
    Async(AsyncLatch),
}

impl QuorumLatch {
    pub fn for_required(required: usize, handler: Option<Arc<dyn AsyncAckHandler>>) -> Self {
        match (required, handler) {
            (0, _) => QuorumLatch::None,
            (_, Some(handler)) => QuorumLatch::Async(AsyncLatch::new(required, handler)),
            (1, None) => QuorumLatch::Single(WaiterLatch::new(1, false)),
            (n, None) => QuorumLatch::Multi(WaiterLatch::new(n, true)),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, QuorumLatch::Async(_))
    }

    pub fn as_async(&self) -> Option<&AsyncLatch> {
        match self {
            QuorumLatch::Async(latch) => Some(latch),
            _ => None,
        }
    }

    /// Releases blocked waiters; their wait reports that the quorum was not reached.
    pub fn release_waiters(&self) {
        match self {
            QuorumLatch::Single(latch) | QuorumLatch::Multi(latch) => latch.release(),
            QuorumLatch::None | QuorumLatch::Async(_) => {}
        }
    }

    /// Wakes blocked waiters so they re-check their abandon condition.
    pub fn wake_waiters(&self) {
        match self {
            QuorumLatch::Single(latch) | QuorumLatch::Multi(latch) => latch.wake(),
            QuorumLatch::None | QuorumLatch::Async(_) => {}
        }
    }
}

impl AckLatch for QuorumLatch {
    fn count_down(&self) {
        match self {
            QuorumLatch::None => {}
            QuorumLatch::Single(latch) | QuorumLatch::Multi(latch) => latch.count_down(),
            QuorumLatch::Async(latch) => latch.count_down(),
        }
    }

    fn count(&self) -> usize {
        match self {
            QuorumLatch::None => 0,
            QuorumLatch::Single(latch) | QuorumLatch::Multi(latch) => latch.count(),
            QuorumLatch::Async(latch) => latch.count(),
        }
    }

    fn await_with_timeout(&self, timeout: Duration, abandon: &dyn Fn() -> bool) -> bool {
        match self {
            QuorumLatch::None => true,
            QuorumLatch::Single(latch) | QuorumLatch::Multi(latch) => {
                latch.await_with_timeout(timeout, abandon)
            }
            QuorumLatch::Async(latch) => latch.await_with_timeout(timeout, abandon),
        }
    }
}

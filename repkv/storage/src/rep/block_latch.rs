use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::lock::wait_deadline;

/// Proof of holding a [`BlockLatch`] in some mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatchStamp(u64);

#[derive(Debug, Default)]
struct LatchState {
    readers: HashSet<u64>,
    writer: Option<u64>,
    next_stamp: u64,
}

impl LatchState {
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }
}

/// Node-wide reader/writer latch excluding a master transfer while commit and abort records
/// are written. Commits take it in read mode, the transfer in write mode. Not reentrant.
#[derive(Debug, Default)]
pub struct BlockLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl BlockLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_read_lock(&self, timeout: Duration) -> Option<LatchStamp> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.writer.is_some() {
            if wait_deadline(&self.changed, &mut state, deadline) && state.writer.is_some() {
                return None;
            }
        }
        let stamp = state.stamp();
        state.readers.insert(stamp);
        Some(LatchStamp(stamp))
    }

    pub fn unlock_read(&self, stamp: LatchStamp) -> bool {
        let released = self.state.lock().readers.remove(&stamp.0);
        if released {
            self.changed.notify_all();
        }
        released
    }

    pub fn try_write_lock(&self, timeout: Duration) -> Option<LatchStamp> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.writer.is_some() || !state.readers.is_empty() {
            if wait_deadline(&self.changed, &mut state, deadline)
                && (state.writer.is_some() || !state.readers.is_empty())
            {
                return None;
            }
        }
        let stamp = state.stamp();
        state.writer = Some(stamp);
        Some(LatchStamp(stamp))
    }

    pub fn unlock_write(&self, stamp: LatchStamp) -> bool {
        let mut state = self.state.lock();
        if state.writer != Some(stamp.0) {
            return false;
        }
        state.writer = None;
        drop(state);
        self.changed.notify_all();
        true
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_readers_share_writer_excludes() {
        let latch = BlockLatch::new();
        let r1 = latch.try_read_lock(Duration::ZERO).unwrap();
        let r2 = latch.try_read_lock(Duration::ZERO).unwrap();
        assert_ne!(r1, r2);
        assert!(latch.try_write_lock(Duration::from_millis(10)).is_none());

        assert!(latch.unlock_read(r1));
        assert!(!latch.unlock_read(r1));
        assert!(latch.unlock_read(r2));

        let w = latch.try_write_lock(Duration::ZERO).unwrap();
        assert!(latch.try_read_lock(Duration::from_millis(10)).is_none());
        assert!(latch.unlock_write(w));
        assert_eq!(latch.reader_count(), 0);
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let latch = Arc::new(BlockLatch::new());
        let w = latch.try_write_lock(Duration::ZERO).unwrap();
        let reader = {
            let latch = latch.clone();
            thread::spawn(move || latch.try_read_lock(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        latch.unlock_write(w);
        assert!(reader.join().unwrap().is_some());
    }

    #[test]
    fn test_unbounded_timeout() {
        let latch = Arc::new(BlockLatch::new());
        let r = latch.try_read_lock(Duration::MAX).unwrap();
        let writer = {
            let latch = latch.clone();
            thread::spawn(move || latch.try_write_lock(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        latch.unlock_read(r);
        let w = writer.join().unwrap().unwrap();
        assert!(latch.unlock_write(w));
    }
}

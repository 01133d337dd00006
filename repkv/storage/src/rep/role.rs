//! Replication role of this node, as seen by transactions.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use repkv_transaction::MasterIdTerm;
use tracing::info;

use crate::error::Interrupted;
use crate::lock::wait_deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Master,
    Replica,
    Unknown,
}

/// Answers which role the node currently plays and which terms it has held.
pub trait RoleSource: Send + Sync {
    fn current_role(&self) -> ReplicaRole;

    /// Term of this node while it is master.
    fn master_id_term(&self) -> Option<MasterIdTerm>;

    /// Last term this node held as master before its current role.
    fn previous_master_id_term(&self) -> Option<MasterIdTerm>;

    /// The master this node follows, when it is a replica and knows one.
    fn known_master(&self) -> Option<MasterIdTerm> {
        None
    }
}

/// Blocks writers until the master has proven its mastership to a quorum.
pub trait AuthoritativeGate: Send + Sync {
    /// Returns `Ok(false)` if the master did not become authoritative within `timeout`.
    fn await_authoritative(&self, timeout: Duration) -> Result<bool, Interrupted>;
}

#[derive(Debug)]
struct RoleState {
    role: ReplicaRole,
    current: Option<MasterIdTerm>,
    previous: Option<MasterIdTerm>,
    known_master: Option<MasterIdTerm>,
    authoritative: bool,
    /// Bumped to wake and fail every blocked waiter.
    interrupts: u64,
}

/// Role bookkeeping of the local node, driven by the election layer.
#[derive(Debug)]
pub struct NodeState {
    node_id: u32,
    state: Mutex<RoleState>,
    changed: Condvar,
}

impl NodeState {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            state: Mutex::new(RoleState {
                role: ReplicaRole::Unknown,
                current: None,
                previous: None,
                known_master: None,
                authoritative: false,
                interrupts: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Makes this node master for `term`. It is not authoritative until
    /// [`NodeState::set_authoritative`] says so.
    pub fn become_master(&self, term: u64) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.take() {
            state.previous = Some(current);
        }
        let id_term = MasterIdTerm::new(self.node_id, term);
        state.role = ReplicaRole::Master;
        state.current = Some(id_term);
        state.known_master = Some(id_term);
        state.authoritative = false;
        info!(node_id = self.node_id, term, "became master");
        self.changed.notify_all();
    }

    pub fn become_replica(&self, master: Option<MasterIdTerm>) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.take() {
            state.previous = Some(current);
        }
        state.role = ReplicaRole::Replica;
        state.known_master = master;
        state.authoritative = false;
        info!(node_id = self.node_id, ?master, "became replica");
        self.changed.notify_all();
    }

    pub fn set_unknown(&self) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.take() {
            state.previous = Some(current);
        }
        state.role = ReplicaRole::Unknown;
        state.known_master = None;
        state.authoritative = false;
        self.changed.notify_all();
    }

    pub fn set_authoritative(&self, authoritative: bool) {
        self.state.lock().authoritative = authoritative;
        self.changed.notify_all();
    }

    /// Fails every thread currently blocked in `await_authoritative`.
    pub fn interrupt_waiters(&self) {
        self.state.lock().interrupts += 1;
        self.changed.notify_all();
    }
}

impl RoleSource for NodeState {
    fn current_role(&self) -> ReplicaRole {
        self.state.lock().role
    }

    fn master_id_term(&self) -> Option<MasterIdTerm> {
        self.state.lock().current
    }

    fn previous_master_id_term(&self) -> Option<MasterIdTerm> {
        self.state.lock().previous
    }

    fn known_master(&self) -> Option<MasterIdTerm> {
        self.state.lock().known_master
    }
}

impl AuthoritativeGate for NodeState {
    fn await_authoritative(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let interrupts = state.interrupts;
        loop {
            if state.interrupts != interrupts {
                return Err(Interrupted);
            }
            if state.role == ReplicaRole::Master && state.authoritative {
                return Ok(true);
            }
            if wait_deadline(&self.changed, &mut state, deadline) {
                return Ok(state.role == ReplicaRole::Master && state.authoritative);
            }
        }
    }
}

/// Supplies the master term embedded in commit and abort records.
///
/// Must be called with the log-append mutex held. Successive results never decrease, even
/// while the role changes: a node that is no longer master reports the last term it held,
/// and `MasterIdTerm::PRIMORDIAL` is used only if it never held one.
pub struct MasterTermAccessor {
    last: Mutex<MasterIdTerm>,
}

impl MasterTermAccessor {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(MasterIdTerm::PRIMORDIAL),
        }
    }

    pub fn capture(&self, roles: &dyn RoleSource) -> MasterIdTerm {
        let candidate = match roles.current_role() {
            ReplicaRole::Master => roles.master_id_term(),
            ReplicaRole::Replica | ReplicaRole::Unknown => None,
        }
        .or_else(|| roles.previous_master_id_term());

        let mut last = self.last.lock();
        if let Some(candidate) = candidate {
            if candidate.term() >= last.term() {
                *last = candidate;
            }
        }
        *last
    }
}

impl Default for MasterTermAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_role_transitions_keep_previous_term() {
        let node = NodeState::new(3);
        assert_eq!(node.current_role(), ReplicaRole::Unknown);

        node.become_master(5);
        assert_eq!(node.master_id_term(), Some(MasterIdTerm::new(3, 5)));

        node.become_replica(Some(MasterIdTerm::new(1, 6)));
        assert_eq!(node.current_role(), ReplicaRole::Replica);
        assert_eq!(node.master_id_term(), None);
        assert_eq!(node.previous_master_id_term(), Some(MasterIdTerm::new(3, 5)));
        assert_eq!(node.known_master(), Some(MasterIdTerm::new(1, 6)));
    }

    #[test]
    fn test_term_accessor_never_decreases() {
        let node = NodeState::new(1);
        let accessor = MasterTermAccessor::new();
        assert_eq!(accessor.capture(&node), MasterIdTerm::PRIMORDIAL);

        node.become_master(4);
        assert_eq!(accessor.capture(&node), MasterIdTerm::new(1, 4));

        // Once the node has lost mastership the last held term is reported.
        node.become_replica(None);
        assert_eq!(accessor.capture(&node), MasterIdTerm::new(1, 4));
        node.set_unknown();
        assert_eq!(accessor.capture(&node), MasterIdTerm::new(1, 4));

        node.become_master(9);
        assert_eq!(accessor.capture(&node), MasterIdTerm::new(1, 9));
    }

    #[test]
    fn test_await_authoritative() {
        let node = Arc::new(NodeState::new(1));
        node.become_master(1);
        assert_eq!(node.await_authoritative(Duration::from_millis(10)), Ok(false));

        let waiter = {
            let node = node.clone();
            thread::spawn(move || node.await_authoritative(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        node.set_authoritative(true);
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }

    #[test]
    fn test_await_authoritative_interrupted() {
        let node = Arc::new(NodeState::new(1));
        let waiter = {
            let node = node.clone();
            thread::spawn(move || node.await_authoritative(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        node.interrupt_waiters();
        assert_eq!(waiter.join().unwrap(), Err(Interrupted));
    }
}

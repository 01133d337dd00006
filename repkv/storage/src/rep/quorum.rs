use std::sync::atomic::{AtomicUsize, Ordering};

use repkv_transaction::ReplicaAckPolicy;

/// Computes how many replica acks a policy demands, from the current group membership.
pub trait QuorumPolicy: Send + Sync {
    fn required_ack_count(&self, policy: ReplicaAckPolicy) -> usize;
}

/// The electable members of a replication group, the master included.
#[derive(Debug)]
pub struct ElectableGroup {
    size: AtomicUsize,
}

impl ElectableGroup {
    pub fn new(size: usize) -> Self {
        Self {
            size: AtomicUsize::new(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }
}

impl QuorumPolicy for ElectableGroup {
    fn required_ack_count(&self, policy: ReplicaAckPolicy) -> usize {
        let size = self.size();
        match policy {
            ReplicaAckPolicy::All => size.saturating_sub(1),
            // A majority is size / 2 + 1 nodes, one of which is the master itself.
            ReplicaAckPolicy::SimpleMajority => size / 2,
            ReplicaAckPolicy::None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_acks() {
        let group = ElectableGroup::new(5);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::All), 4);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::SimpleMajority), 2);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::None), 0);

        group.set_size(1);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::All), 0);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::SimpleMajority), 0);

        group.set_size(2);
        assert_eq!(group.required_ack_count(ReplicaAckPolicy::SimpleMajority), 1);
    }
}

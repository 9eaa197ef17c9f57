//! Cluster topology snapshots consumed by the coordination loops.
//!
//! Topology is an input here: membership changes are driven elsewhere and
//! reach this layer as read-only snapshots.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use keel_consensus::log::NodeId;

/// Cluster member lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Joining,
    Active,
    Decommissioning,
    Removed,
}

/// Cluster member descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberDesc {
    pub node_id: NodeId,
    pub state: MemberState,
    pub shard_count: u32,
}

/// Point-in-time view of cluster membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    pub members: BTreeMap<NodeId, MemberDesc>,
}

impl Topology {
    /// Members that take part in work placement.
    pub fn active_members(&self) -> impl Iterator<Item = &MemberDesc> {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Active)
    }
}

/// Shared handle producing topology snapshots.
#[derive(Clone)]
pub struct TopologyHandle {
    inner: Arc<RwLock<Topology>>,
}

impl TopologyHandle {
    pub fn new(topology: Topology) -> Self {
        Self {
            inner: Arc::new(RwLock::new(topology)),
        }
    }

    pub fn snapshot(&self) -> Topology {
        self.inner.read().unwrap().clone()
    }

    pub fn set_member(&self, member: MemberDesc) {
        let mut topology = self.inner.write().unwrap();
        topology.members.insert(member.node_id, member);
    }

    pub fn remove_member(&self, node_id: NodeId) {
        let mut topology = self.inner.write().unwrap();
        topology.members.remove(&node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(node_id: NodeId, state: MemberState, shard_count: u32) -> MemberDesc {
        MemberDesc {
            node_id,
            state,
            shard_count,
        }
    }

    #[test]
    fn only_active_members_participate() {
        let handle = TopologyHandle::new(Topology::default());
        handle.set_member(member(1, MemberState::Active, 2));
        handle.set_member(member(2, MemberState::Decommissioning, 4));
        handle.set_member(member(3, MemberState::Joining, 1));

        let snapshot = handle.snapshot();
        let active: Vec<NodeId> = snapshot.active_members().map(|m| m.node_id).collect();
        assert_eq!(active, vec![1]);
    }

    #[test]
    fn snapshots_are_isolated_from_later_updates() {
        let handle = TopologyHandle::new(Topology::default());
        handle.set_member(member(1, MemberState::Active, 2));
        let before = handle.snapshot();
        handle.set_member(member(2, MemberState::Active, 2));
        handle.remove_member(1);
        assert_eq!(before.members.len(), 1);
        let after = handle.snapshot();
        assert_eq!(after.members.len(), 1);
        assert!(after.members.contains_key(&2));
    }
}

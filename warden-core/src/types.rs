//! # Core Types
//!
//! Cluster identity and membership types shared by every Warden crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a consensus participant.
///
/// Node identifiers are operator-chosen strings (the host name by default)
/// and must be unique across the cluster.
///
/// # Examples
///
/// ```rust
/// use warden_core::NodeId;
///
/// let node_id = NodeId::new("node-a");
/// assert_eq!(node_id.as_str(), "node-a");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single member of the replicated cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: NodeId,
    /// Raft transport address (`host:port`).
    pub address: String,
    /// Voters count toward quorum and may become leader.
    pub voter: bool,
}

impl ClusterMember {
    pub fn voter(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: true,
        }
    }

    pub fn nonvoter(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: false,
        }
    }
}

/// Ordered set of cluster members.
///
/// The authoritative copy lives in the consensus log; every other copy is a
/// snapshot of it. Order is insertion order and is preserved by replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub members: Vec<ClusterMember>,
}

impl Configuration {
    pub fn new(members: Vec<ClusterMember>) -> Self {
        Self { members }
    }

    /// Builds the founding configuration from a static peer map. Every
    /// founder is a voter.
    pub fn from_peers(peers: &BTreeMap<NodeId, String>) -> Self {
        Self {
            members: peers
                .iter()
                .map(|(id, address)| ClusterMember::voter(id.clone(), address.clone()))
                .collect(),
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&ClusterMember> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn find_by_address(&self, address: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.address == address)
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.get(id).map(|m| m.voter).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members.iter().filter(|m| m.voter)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Number of voters needed for a majority.
    pub fn quorum_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns a copy with `member` inserted, replacing an existing entry with
    /// the same id in place.
    pub fn with_member(&self, member: ClusterMember) -> Self {
        let mut members = self.members.clone();
        match members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => *existing = member,
            None => members.push(member),
        }
        Self { members }
    }

    pub fn without_member(&self, id: &NodeId) -> Self {
        Self {
            members: self
                .members
                .iter()
                .filter(|m| &m.id != id)
                .cloned()
                .collect(),
        }
    }
}

/// Run-state label of a consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RaftRole::Follower => "Follower",
            RaftRole::Candidate => "Candidate",
            RaftRole::Leader => "Leader",
            RaftRole::Shutdown => "Shutdown",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of the cluster, built on demand from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub members: Vec<ClusterMember>,
    /// This node.
    pub id: NodeId,
    /// `None` while no leader is known.
    pub leader_id: Option<NodeId>,
    pub status: RaftRole,
    pub term: u64,
}

impl ClusterState {
    pub fn is_leader(&self) -> bool {
        self.leader_id.as_ref() == Some(&self.id)
    }

    pub fn member(&self, id: &NodeId) -> Option<&ClusterMember> {
        self.members.iter().find(|m| &m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> Configuration {
        let mut peers = BTreeMap::new();
        peers.insert(NodeId::new("a"), "10.0.0.1:7300".to_string());
        peers.insert(NodeId::new("b"), "10.0.0.2:7300".to_string());
        peers.insert(NodeId::new("c"), "10.0.0.3:7300".to_string());
        Configuration::from_peers(&peers)
    }

    #[test]
    fn test_quorum_counts_voters_only() {
        let config = three_voters().with_member(ClusterMember::nonvoter("d", "10.0.0.4:7300"));
        assert_eq!(config.len(), 4);
        assert_eq!(config.voter_count(), 3);
        assert_eq!(config.quorum_size(), 2);
        assert!(!config.is_voter(&NodeId::new("d")));
    }

    #[test]
    fn test_with_member_replaces_in_place() {
        let config = three_voters().with_member(ClusterMember::nonvoter("b", "10.0.0.9:7300"));
        assert_eq!(config.len(), 3);
        assert_eq!(config.members[1].address, "10.0.0.9:7300");
        assert!(!config.members[1].voter);
    }

    #[test]
    fn test_without_member_and_lookup() {
        let config = three_voters().without_member(&NodeId::new("a"));
        assert_eq!(config.len(), 2);
        assert!(!config.contains(&NodeId::new("a")));
        assert_eq!(
            config.find_by_address("10.0.0.3:7300").map(|m| m.id.clone()),
            Some(NodeId::new("c"))
        );
    }

    #[test]
    fn test_cluster_state_json_shape() {
        let state = ClusterState {
            members: three_voters().members,
            id: NodeId::new("a"),
            leader_id: Some(NodeId::new("a")),
            status: RaftRole::Leader,
            term: 3,
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["leader_id"], "a");
        assert_eq!(value["status"], "Leader");
        assert_eq!(value["members"][0]["voter"], true);
        assert!(state.is_leader());
    }
}

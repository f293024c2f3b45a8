//! Multi-node clusters of [`ConsensusManager`]s over a [`NetworkSimulator`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

use warden_core::NodeId;
use warden_engine::RaftConfig;
use warden_leader::{ConsensusManager, LeaderError, LeaderResult};

use crate::network_sim::NetworkSimulator;

/// Default bound for [`ClusterHarness::wait_for_leader`] and friends.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct TestNode {
    store: TempDir,
    manager: Option<Arc<ConsensusManager>>,
}

pub struct ClusterHarness {
    network: NetworkSimulator,
    raft_config: RaftConfig,
    operation_timeout: Option<Duration>,
    peers: BTreeMap<NodeId, String>,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl ClusterHarness {
    /// `size` founders named `node-1..=node-size` at `10.0.0.<n>:7300`.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let mut peers = BTreeMap::new();
        let mut nodes = BTreeMap::new();
        for n in 1..=size {
            let id = NodeId::new(format!("node-{}", n));
            peers.insert(id.clone(), format!("10.0.0.{}:7300", n));
            nodes.insert(
                id,
                TestNode {
                    store: tempfile::tempdir()?,
                    manager: None,
                },
            );
        }
        Ok(Self {
            network: NetworkSimulator::new(),
            raft_config: RaftConfig::fast(),
            operation_timeout: None,
            peers,
            nodes,
        })
    }

    pub fn with_raft_config(mut self, raft_config: RaftConfig) -> Self {
        self.raft_config = raft_config;
        self
    }

    /// Bound on membership changes for managers started after this call.
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = Some(operation_timeout);
        self
    }

    pub fn network(&self) -> &NetworkSimulator {
        &self.network
    }

    pub fn peers(&self) -> &BTreeMap<NodeId, String> {
        &self.peers
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// The manager for `id`, while it is running.
    pub fn manager(&self, id: &NodeId) -> Option<Arc<ConsensusManager>> {
        self.nodes.get(id).and_then(|n| n.manager.clone())
    }

    pub fn running(&self) -> Vec<(NodeId, Arc<ConsensusManager>)> {
        self.nodes
            .iter()
            .filter_map(|(id, n)| n.manager.clone().map(|m| (id.clone(), m)))
            .collect()
    }

    fn build_manager(&self, id: &NodeId) -> LeaderResult<ConsensusManager> {
        let manager = ConsensusManager::new(
            id.clone(),
            self.raft_config.clone(),
            Arc::new(self.network.clone()),
        )?;
        Ok(match self.operation_timeout {
            Some(operation_timeout) => manager.with_operation_timeout(operation_timeout),
            None => manager,
        })
    }

    pub async fn start_all(&mut self) -> LeaderResult<()> {
        for id in self.node_ids() {
            self.start_node_with_peers(&id, self.peers.clone()).await?;
        }
        Ok(())
    }

    /// Starts `id` against its store using `peers` as the configuration.
    pub async fn start_node_with_peers(
        &mut self,
        id: &NodeId,
        peers: BTreeMap<NodeId, String>,
    ) -> LeaderResult<()> {
        let manager = self.build_manager(id)?;
        let store = self
            .nodes
            .get(id)
            .map(|n| n.store.path().to_path_buf())
            .ok_or_else(|| LeaderError::config(format!("unknown node {}", id)))?;
        manager.init_or_join(&peers, &store).await?;
        info!(node_id = %id, "test node started");
        if let Some(node) = self.nodes.get_mut(id) {
            node.manager = Some(Arc::new(manager));
        }
        Ok(())
    }

    pub async fn restart_node(&mut self, id: &NodeId) -> LeaderResult<()> {
        self.stop_node(id).await;
        self.start_node_with_peers(id, self.peers.clone()).await
    }

    pub async fn stop_node(&mut self, id: &NodeId) {
        let manager = self.nodes.get_mut(id).and_then(|n| n.manager.take());
        if let Some(manager) = manager {
            manager.shutdown().await;
            info!(node_id = %id, "test node stopped");
        }
    }

    pub async fn shutdown(&mut self) {
        for id in self.node_ids() {
            self.stop_node(&id).await;
        }
    }

    /// The node every running, reachable node agrees is leader.
    pub fn current_leader(&self) -> Option<NodeId> {
        let mut leader = None;
        for (id, manager) in self.running() {
            let Ok(state) = manager.status() else {
                continue;
            };
            if state.is_leader() {
                if leader.is_some() {
                    // Two nodes believe they lead in different terms
                    return None;
                }
                leader = Some(id);
            }
        }
        leader
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let found = eventually(timeout, || async move { self.current_leader().is_some() }).await;
        if found {
            self.current_leader()
        } else {
            None
        }
    }

    /// Waits for a leader other than `old`.
    pub async fn wait_for_new_leader(&self, old: &NodeId, timeout: Duration) -> Option<NodeId> {
        let found = eventually(timeout, || async move {
            matches!(self.current_leader(), Some(leader) if &leader != old)
        })
        .await;
        if found {
            self.current_leader()
        } else {
            None
        }
    }

    /// Waits until every running node reports exactly `members`.
    pub async fn wait_for_members(&self, members: &[NodeId], timeout: Duration) -> bool {
        let mut expected = members.to_vec();
        expected.sort();
        eventually(timeout, || {
            let expected = expected.clone();
            async move {
                self.running().iter().all(|(_, manager)| {
                    manager
                        .status()
                        .map(|state| {
                            let mut ids: Vec<NodeId> =
                                state.members.into_iter().map(|m| m.id).collect();
                            ids.sort();
                            ids == expected
                        })
                        .unwrap_or(false)
                })
            }
        })
        .await
    }
}

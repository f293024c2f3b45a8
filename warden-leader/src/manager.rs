//! Lifecycle and membership API of the local consensus engine.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use warden_core::{
    network::TransportFactory, persistence::PersistenceLayer, state_machine::NoopStateMachine,
    ClusterState, Configuration, NodeId, Observation, ObservationFilter, WardenError,
};
use warden_engine::{
    bootstrap_cluster, recover_configuration, MembershipChange, ObserverId, RaftConfig, RaftHandle,
    RaftNode,
};
use warden_persistence::FileSystemPersistence;

use crate::dispatcher::ObservationSource;
use crate::plugin::ClusterStatus;
use crate::{LeaderError, LeaderResult};

/// Upper bound on a single membership change.
pub const MEMBER_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);

const CHANGE_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of the manager, as seen from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Bootstrapping,
    Joining,
    Running,
    ShuttingDown,
    Stopped,
}

/// Owns the consensus engine bound to this node.
///
/// Membership changes are serialized: at most one `add_member` or
/// `del_member` is in flight per manager. `status` never waits on them.
pub struct ConsensusManager {
    node_id: NodeId,
    raft_config: RaftConfig,
    transports: Arc<dyn TransportFactory>,
    state: RwLock<ManagerState>,
    engine: RwLock<Option<RaftHandle>>,
    membership: Mutex<()>,
    operation_timeout: Duration,
}

impl ConsensusManager {
    pub fn new(
        node_id: NodeId,
        raft_config: RaftConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> LeaderResult<Self> {
        if node_id.is_empty() {
            return Err(LeaderError::config("node id must not be empty"));
        }
        Ok(Self {
            node_id,
            raft_config,
            transports,
            state: RwLock::new(ManagerState::Uninitialized),
            engine: RwLock::new(None),
            membership: Mutex::new(()),
            operation_timeout: MEMBER_OPERATION_TIMEOUT,
        })
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    fn engine(&self) -> LeaderResult<RaftHandle> {
        if *self.state.read() != ManagerState::Running {
            return Err(LeaderError::NotInitialized);
        }
        self.engine.read().clone().ok_or(LeaderError::NotInitialized)
    }

    /// Bootstraps a new cluster from `initial_peers`, or rejoins the cluster
    /// recorded in `store_path`.
    ///
    /// Prior state in the store is the only thing that selects rejoin. On
    /// rejoin the address bound is the one persisted for this node; the
    /// entry in `initial_peers` is ignored.
    pub async fn init_or_join(
        &self,
        initial_peers: &BTreeMap<NodeId, String>,
        store_path: impl AsRef<Path>,
    ) -> LeaderResult<()> {
        {
            let mut state = self.state.write();
            if *state != ManagerState::Uninitialized {
                return Err(LeaderError::AlreadyInitialized);
            }
            // Claimed until we know which branch applies
            *state = ManagerState::Bootstrapping;
        }

        match self.start_engine(initial_peers, store_path.as_ref()).await {
            Ok(handle) => {
                *self.engine.write() = Some(handle);
                *self.state.write() = ManagerState::Running;
                info!(node_id = %self.node_id, "consensus engine running");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = ManagerState::Uninitialized;
                error!(node_id = %self.node_id, error = %e, "failed to start consensus engine");
                Err(e)
            }
        }
    }

    async fn start_engine(
        &self,
        initial_peers: &BTreeMap<NodeId, String>,
        store_path: &Path,
    ) -> LeaderResult<RaftHandle> {
        let persistence = Arc::new(FileSystemPersistence::new(store_path).await?);

        let (address, founders) = if persistence.has_existing_state().await? {
            *self.state.write() = ManagerState::Joining;
            let address = self.recover_address(persistence.as_ref(), initial_peers).await?;
            (address, None)
        } else {
            let address = initial_peers
                .get(&self.node_id)
                .cloned()
                .ok_or_else(|| LeaderError::SelfNotInInitialPeers {
                    node_id: self.node_id.clone(),
                })?;
            (address, Some(Configuration::from_peers(initial_peers)))
        };

        let (transport, inbound) = self.transports.bind(&self.node_id, &address).await?;

        if let Some(founders) = founders {
            info!(
                node_id = %self.node_id,
                address = %address,
                members = founders.len(),
                "bootstrapping new cluster"
            );
            if let Err(e) = bootstrap_cluster(persistence.as_ref(), &founders).await {
                transport.shutdown().await;
                return Err(e.into());
            }
        } else {
            info!(node_id = %self.node_id, address = %address, "rejoining existing cluster");
        }

        match RaftNode::start(
            self.node_id.clone(),
            self.raft_config.clone(),
            transport.clone(),
            inbound,
            persistence,
            Box::new(NoopStateMachine::new()),
        )
        .await
        {
            Ok(handle) => Ok(handle),
            Err(e) => {
                transport.shutdown().await;
                Err(e.into())
            }
        }
    }

    async fn recover_address(
        &self,
        persistence: &dyn PersistenceLayer,
        initial_peers: &BTreeMap<NodeId, String>,
    ) -> LeaderResult<String> {
        let configuration = recover_configuration(persistence)
            .await?
            .ok_or_else(|| LeaderError::Internal {
                reason: "store reported state but held no configuration".to_string(),
            })?;

        let member = configuration
            .get(&self.node_id)
            .ok_or_else(|| LeaderError::NotClusterMember {
                node_id: self.node_id.clone(),
            })?;

        if let Some(fresh) = initial_peers.get(&self.node_id) {
            if fresh != &member.address {
                warn!(
                    node_id = %self.node_id,
                    persisted = %member.address,
                    configured = %fresh,
                    "configured address differs from persisted address, using persisted"
                );
            }
        }
        Ok(member.address.clone())
    }

    /// Point-in-time view of members, leader and run state.
    pub fn status(&self) -> LeaderResult<ClusterState> {
        let status = self.engine()?.status();
        Ok(ClusterState {
            members: status.configuration.members,
            id: status.id,
            leader_id: status.leader,
            status: status.role,
            term: status.term,
        })
    }

    /// Adds a member, as voter or non-voter.
    ///
    /// Succeeds without change if `id` is already a member. Fails with
    /// `AddressConflict` if another member already uses `address`.
    pub async fn add_member(&self, id: NodeId, address: String, voter: bool) -> LeaderResult<()> {
        let engine = self.engine()?;
        let _guard = self.membership.lock().await;

        if !engine.is_leader() {
            return Err(LeaderError::NotLeader {
                leader: engine.leader(),
            });
        }

        let configuration = engine.configuration();
        if configuration.contains(&id) {
            debug!(node_id = %self.node_id, member = %id, "member already present");
            return Ok(());
        }
        if let Some(existing) = configuration.find_by_address(&address) {
            return Err(LeaderError::AddressConflict {
                id,
                address,
                existing: existing.id.clone(),
            });
        }

        let operation = format!("add member {}", id);
        let change = if voter {
            MembershipChange::AddVoter {
                id: id.clone(),
                address: address.clone(),
            }
        } else {
            MembershipChange::AddNonvoter {
                id: id.clone(),
                address: address.clone(),
            }
        };
        self.apply_change(&engine, change, operation).await?;

        info!(node_id = %self.node_id, member = %id, address = %address, voter, "member added");
        Ok(())
    }

    /// Removes a member. Removing an id that is not a member succeeds.
    pub async fn del_member(&self, id: NodeId) -> LeaderResult<()> {
        let engine = self.engine()?;
        let _guard = self.membership.lock().await;

        if !engine.is_leader() {
            return Err(LeaderError::NotLeader {
                leader: engine.leader(),
            });
        }

        let operation = format!("remove member {}", id);
        let change = MembershipChange::RemoveServer { id: id.clone() };
        self.apply_change(&engine, change, operation).await?;

        info!(node_id = %self.node_id, member = %id, "member removed");
        Ok(())
    }

    /// Submits `change`, waiting out a configuration entry still being
    /// committed from an earlier change, all within the operation timeout.
    async fn apply_change(
        &self,
        engine: &RaftHandle,
        change: MembershipChange,
        operation: String,
    ) -> LeaderResult<()> {
        let attempt = async {
            loop {
                match engine.change_membership(change.clone()).await {
                    Err(WardenError::ConfigChangeInProgress) => {
                        debug!(node_id = %self.node_id, operation = %operation, "configuration change in progress, retrying");
                        sleep(CHANGE_RETRY_INTERVAL).await;
                    }
                    other => return other,
                }
            }
        };
        let outcome = timeout(self.operation_timeout, attempt).await;
        match outcome {
            Ok(result) => result.map_err(LeaderError::from_engine),
            Err(_) => Err(LeaderError::Timeout { operation }),
        }
    }

    /// `true` when this node becomes leader, `false` when it stops being
    /// leader. A slow reader sees only the most recent value.
    pub fn leadership_notifications(&self) -> LeaderResult<watch::Receiver<bool>> {
        Ok(self.engine()?.leadership())
    }

    /// Attaches a filtered tap to the engine's observation stream.
    pub fn register_observer(
        &self,
        filter: ObservationFilter,
        sink: mpsc::Sender<Observation>,
    ) -> LeaderResult<ObserverId> {
        Ok(self.engine()?.register_observer(filter, sink))
    }

    pub fn deregister_observer(&self, id: &ObserverId) -> bool {
        match self.engine.read().as_ref() {
            Some(engine) => engine.deregister_observer(id),
            None => false,
        }
    }

    /// Stops the engine. Errors are logged, never returned.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, ManagerState::ShuttingDown | ManagerState::Stopped) {
                return;
            }
            *state = ManagerState::ShuttingDown;
        }

        let engine = self.engine.write().take();
        if let Some(engine) = engine {
            info!(node_id = %self.node_id, "shutting down consensus engine");
            if let Err(e) = engine.shutdown().await {
                error!(node_id = %self.node_id, error = %e, "consensus engine did not stop cleanly");
            }
        }
        *self.state.write() = ManagerState::Stopped;
    }
}

impl ClusterStatus for ConsensusManager {
    fn cluster_state(&self) -> LeaderResult<ClusterState> {
        self.status()
    }
}

impl ObservationSource for ConsensusManager {
    fn register_observer(
        &self,
        filter: ObservationFilter,
        sink: mpsc::Sender<Observation>,
    ) -> LeaderResult<ObserverId> {
        ConsensusManager::register_observer(self, filter, sink)
    }

    fn deregister_observer(&self, id: &ObserverId) -> bool {
        ConsensusManager::deregister_observer(self, id)
    }
}

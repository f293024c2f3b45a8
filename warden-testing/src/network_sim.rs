use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use warden_core::{
    messages::{RpcRequest, RpcResponse},
    network::{InboundReceiver, InboundRpc, RaftTransport, TransportFactory},
    NodeId, Result, WardenError,
};

const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct NetworkConditions {
    pub latency_min: Duration,
    pub latency_max: Duration,
    pub packet_loss_rate: f64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            latency_min: Duration::from_millis(0),
            latency_max: Duration::from_millis(2),
            packet_loss_rate: 0.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct NetworkStats {
    pub calls_sent: u64,
    pub calls_delivered: u64,
    pub calls_dropped: u64,
}

struct Endpoint {
    node_id: NodeId,
    inbound: mpsc::Sender<InboundRpc>,
}

#[derive(Default)]
struct SimState {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    /// Each set is cut off from every node outside it.
    partitions: RwLock<Vec<HashSet<NodeId>>>,
    isolated: RwLock<HashSet<NodeId>>,
    conditions: RwLock<NetworkConditions>,
    stats: Mutex<NetworkStats>,
    bindings: Mutex<Vec<(NodeId, String)>>,
    next_port: AtomicU16,
}

impl SimState {
    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        self.partitions
            .read()
            .iter()
            .all(|side| side.contains(from) == side.contains(to))
    }

    fn dropped(&self) {
        self.stats.lock().calls_dropped += 1;
    }
}

/// In-memory [`TransportFactory`] with fault injection.
///
/// Addresses are plain strings; nothing touches the host network. A port
/// of `0` is replaced by a fresh port, the same way a real listener would.
#[derive(Clone)]
pub struct NetworkSimulator {
    state: Arc<SimState>,
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    pub fn new() -> Self {
        let state = SimState {
            next_port: AtomicU16::new(40000),
            ..SimState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn update_conditions(&self, conditions: NetworkConditions) {
        debug!("Updated network conditions: {:?}", conditions);
        *self.state.conditions.write() = conditions;
    }

    /// Cuts `nodes` off from every node outside the set.
    pub fn partition(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let side: HashSet<NodeId> = nodes.into_iter().collect();
        warn!("Created network partition with nodes: {:?}", side);
        self.state.partitions.write().push(side);
    }

    pub fn isolate(&self, node: &NodeId) {
        warn!("Isolated node {}", node);
        self.state.isolated.write().insert(node.clone());
    }

    pub fn reconnect(&self, node: &NodeId) {
        info!("Reconnected node {}", node);
        self.state.isolated.write().remove(node);
    }

    /// Removes every partition and isolation.
    pub fn heal(&self) {
        self.state.partitions.write().clear();
        self.state.isolated.write().clear();
        info!("Healed all network partitions");
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.stats.lock().clone()
    }

    /// Every `(node, address)` bound so far, oldest first.
    pub fn bindings(&self) -> Vec<(NodeId, String)> {
        self.state.bindings.lock().clone()
    }

    /// The address `node` bound most recently.
    pub fn last_bound_address(&self, node: &NodeId) -> Option<String> {
        self.state
            .bindings
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == node)
            .map(|(_, address)| address.clone())
    }

    fn resolve(&self, address: &str) -> String {
        match address.rsplit_once(':') {
            Some((host, "0")) => {
                let port = self.state.next_port.fetch_add(1, Ordering::Relaxed);
                format!("{}:{}", host, port)
            }
            _ => address.to_string(),
        }
    }
}

#[async_trait]
impl TransportFactory for NetworkSimulator {
    async fn bind(
        &self,
        node_id: &NodeId,
        address: &str,
    ) -> Result<(Arc<dyn RaftTransport>, InboundReceiver)> {
        let address = self.resolve(address);
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        {
            let mut endpoints = self.state.endpoints.write();
            if endpoints.contains_key(&address) {
                return Err(WardenError::network(format!(
                    "address {} already in use",
                    address
                )));
            }
            endpoints.insert(
                address.clone(),
                Endpoint {
                    node_id: node_id.clone(),
                    inbound: tx,
                },
            );
        }
        self.state
            .bindings
            .lock()
            .push((node_id.clone(), address.clone()));
        info!("Added node {} to network simulation at {}", node_id, address);

        let transport: Arc<dyn RaftTransport> = Arc::new(SimulatedTransport {
            node_id: node_id.clone(),
            address,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        Ok((transport, rx))
    }
}

/// One node's view of the simulated network.
pub struct SimulatedTransport {
    node_id: NodeId,
    address: String,
    state: Arc<SimState>,
    closed: AtomicBool,
}

#[async_trait]
impl RaftTransport for SimulatedTransport {
    fn local_address(&self) -> &str {
        &self.address
    }

    async fn call(
        &self,
        target: &NodeId,
        address: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WardenError::Shutdown);
        }
        self.state.stats.lock().calls_sent += 1;

        if !self.state.reachable(&self.node_id, target) {
            self.state.dropped();
            return Err(WardenError::network(format!(
                "{} unreachable from {}",
                target, self.node_id
            )));
        }

        let conditions = self.state.conditions.read().clone();
        let (lost, latency) = {
            let mut rng = rand::thread_rng();
            let lost = rng.gen::<f64>() < conditions.packet_loss_rate;
            let min = conditions.latency_min.as_millis() as u64;
            let max = (conditions.latency_max.as_millis() as u64).max(min);
            (lost, Duration::from_millis(rng.gen_range(min..=max)))
        };
        if lost {
            self.state.dropped();
            return Err(WardenError::network("request lost"));
        }
        sleep(latency).await;

        let inbound = {
            let endpoints = self.state.endpoints.read();
            match endpoints.get(address) {
                Some(endpoint) if &endpoint.node_id == target => endpoint.inbound.clone(),
                Some(endpoint) => {
                    return Err(WardenError::network(format!(
                        "expected {} at {}, found {}",
                        target, address, endpoint.node_id
                    )))
                }
                None => {
                    self.state.dropped();
                    return Err(WardenError::network(format!("connection refused: {}", address)));
                }
            }
        };

        let (reply, response) = oneshot::channel();
        if inbound.send(InboundRpc { request, reply }).await.is_err() {
            self.state.dropped();
            return Err(WardenError::network(format!("{} stopped listening", target)));
        }
        let response = response
            .await
            .map_err(|_| WardenError::network(format!("{} dropped the request", target)))?;

        // A partition raised while the request was in flight loses the reply
        if !self.state.reachable(&self.node_id, target) {
            self.state.dropped();
            return Err(WardenError::network(format!(
                "{} unreachable from {}",
                target, self.node_id
            )));
        }
        self.state.stats.lock().calls_delivered += 1;
        Ok(response)
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut endpoints = self.state.endpoints.write();
        if endpoints
            .get(&self.address)
            .map(|e| e.node_id == self.node_id)
            .unwrap_or(false)
        {
            endpoints.remove(&self.address);
        }
        info!("Removed node {} from network simulation", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::messages::{AppendEntriesRequest, AppendEntriesResponse};

    fn heartbeat(term: u64) -> RpcRequest {
        RpcRequest::AppendEntries(AppendEntriesRequest {
            term,
            leader: NodeId::new("a"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        })
    }

    fn serve(mut inbound: InboundReceiver) {
        tokio::spawn(async move {
            while let Some(rpc) = inbound.recv().await {
                let _ = rpc.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                    term: 3,
                    success: true,
                    last_log_index: 0,
                }));
            }
        });
    }

    #[tokio::test]
    async fn test_call_and_partition() {
        let network = NetworkSimulator::new();
        let (a, _a_in) = network.bind(&NodeId::new("a"), "10.0.0.1:7300").await.unwrap();
        let (_b, b_in) = network.bind(&NodeId::new("b"), "10.0.0.2:7300").await.unwrap();
        serve(b_in);

        let b = NodeId::new("b");
        assert!(a.call(&b, "10.0.0.2:7300", heartbeat(3)).await.is_ok());

        network.partition([NodeId::new("b")]);
        assert!(a.call(&b, "10.0.0.2:7300", heartbeat(3)).await.is_err());

        network.heal();
        assert!(a.call(&b, "10.0.0.2:7300", heartbeat(3)).await.is_ok());

        network.isolate(&NodeId::new("a"));
        assert!(a.call(&b, "10.0.0.2:7300", heartbeat(3)).await.is_err());

        let stats = network.stats();
        assert_eq!(stats.calls_delivered, 2);
        assert_eq!(stats.calls_dropped, 2);
    }

    #[tokio::test]
    async fn test_wrong_node_at_address() {
        let network = NetworkSimulator::new();
        let (a, _a_in) = network.bind(&NodeId::new("a"), "10.0.0.1:7300").await.unwrap();
        let (_b, _b_in) = network.bind(&NodeId::new("b"), "10.0.0.2:7300").await.unwrap();

        let c = NodeId::new("c");
        assert!(a.call(&c, "10.0.0.2:7300", heartbeat(1)).await.is_err());
        assert!(a.call(&c, "10.0.0.3:7300", heartbeat(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_bindings_and_rebind() {
        let network = NetworkSimulator::new();
        let a = NodeId::new("a");
        let (first, _rx) = network.bind(&a, "10.0.0.1:0").await.unwrap();
        assert_ne!(first.local_address(), "10.0.0.1:0");
        assert!(network.bind(&NodeId::new("x"), first.local_address()).await.is_err());

        let bound = first.local_address().to_string();
        first.shutdown().await;
        assert!(matches!(
            first.call(&a, &bound, heartbeat(1)).await,
            Err(WardenError::Shutdown)
        ));

        let (_second, _rx) = network.bind(&a, &bound).await.unwrap();
        assert_eq!(network.bindings().len(), 2);
        assert_eq!(network.last_bound_address(&a), Some(bound));
    }
}

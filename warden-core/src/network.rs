use crate::messages::{RpcRequest, RpcResponse};
use crate::{NodeId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// An RPC received by a transport, waiting for the engine's answer.
#[derive(Debug)]
pub struct InboundRpc {
    pub request: RpcRequest,
    pub reply: oneshot::Sender<RpcResponse>,
}

pub type InboundReceiver = mpsc::Receiver<InboundRpc>;

/// Request/response transport between consensus engines.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Address this transport is bound to.
    fn local_address(&self) -> &str;

    /// Sends `request` to `target` at `address` and waits for its response.
    async fn call(&self, target: &NodeId, address: &str, request: RpcRequest)
        -> Result<RpcResponse>;

    /// Stops accepting inbound RPCs and drops outbound connections.
    async fn shutdown(&self);
}

/// Builds transports bound to a node's address.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn bind(
        &self,
        node_id: &NodeId,
        address: &str,
    ) -> Result<(Arc<dyn RaftTransport>, InboundReceiver)>;
}

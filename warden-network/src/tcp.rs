//! TCP transport for raft RPCs.
//!
//! Every connection starts with a handshake in which both ends exchange node
//! ids. After that the dialling side sends one [`RpcRequest`] frame and waits
//! for exactly one [`RpcResponse`] frame before sending the next request.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_core::{
    messages::{RpcRequest, RpcResponse},
    network::{InboundReceiver, InboundRpc, RaftTransport, TransportFactory},
    NodeId, Result, WardenError,
};

/// Configuration for the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Deadline for writing a request and reading its response
    pub request_timeout: Duration,
    /// Maximum message size (in bytes)
    pub max_message_size: usize,
    /// Inbound RPCs queued for the engine
    pub inbound_buffer: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_message_size: 16 * 1024 * 1024, // 16MB
            inbound_buffer: 256,
        }
    }
}

/// Message frame structure for TCP transport
#[derive(Debug)]
struct MessageFrame {
    /// Length of the message payload
    length: u32,
    /// Message payload
    payload: Bytes,
}

impl MessageFrame {
    fn new(payload: Bytes, max_size: usize) -> Result<Self> {
        if payload.len() > max_size {
            return Err(WardenError::network(format!(
                "Message too large: {} bytes",
                payload.len()
            )));
        }

        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    fn encode<T: Serialize>(value: &T, max_size: usize) -> Result<Self> {
        let bytes = bincode::serialize(value)
            .map_err(|e| WardenError::network(format!("Failed to serialize frame: {}", e)))?;
        Self::new(Bytes::from(bytes), max_size)
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload)
            .map_err(|e| WardenError::network(format!("Failed to deserialize frame: {}", e)))
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u32(self.length);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer
            .write_all(&self.to_bytes())
            .await
            .map_err(|e| WardenError::network(format!("Failed to write frame: {}", e)))
    }

    async fn from_stream<R>(reader: &mut R, max_size: usize) -> Result<Self>
    where
        R: AsyncReadExt + Unpin,
    {
        let length = reader
            .read_u32()
            .await
            .map_err(|e| WardenError::network(format!("Failed to read frame length: {}", e)))?;

        if length as usize > max_size {
            return Err(WardenError::network(format!(
                "Frame too large: {} bytes",
                length
            )));
        }

        let mut payload = vec![0u8; length as usize];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| WardenError::network(format!("Failed to read frame payload: {}", e)))?;

        Ok(Self {
            length,
            payload: Bytes::from(payload),
        })
    }
}

type Connection = Arc<Mutex<TcpStream>>;

/// TCP transport bound to one listening address.
pub struct TcpTransport {
    node_id: NodeId,
    local_addr: String,
    config: TcpTransportConfig,
    /// Outbound connections keyed by peer address
    connections: Mutex<HashMap<String, Connection>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Binds `address` and starts accepting connections. Inbound RPCs are
    /// delivered on the returned receiver.
    pub async fn bind(
        node_id: NodeId,
        address: &str,
        config: TcpTransportConfig,
    ) -> Result<(Arc<Self>, InboundReceiver)> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| WardenError::network(format!("Failed to bind to {}: {}", address, e)))?;
        let actual_addr = listener
            .local_addr()
            .map_err(|e| WardenError::network(format!("Failed to get local address: {}", e)))?;

        // Keep the configured host so the advertised address stays stable;
        // only an ephemeral port is replaced.
        let local_addr = match address.rsplit_once(':') {
            Some((host, "0")) => format!("{}:{}", host, actual_addr.port()),
            _ => address.to_string(),
        };

        info!(node_id = %node_id, address = %local_addr, "TCP transport listening");

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::accept_connections(
            listener,
            node_id.clone(),
            config.clone(),
            inbound_tx,
            shutdown.clone(),
        ));

        let transport = Arc::new(Self {
            node_id,
            local_addr,
            config,
            connections: Mutex::new(HashMap::new()),
            shutdown,
        });
        Ok((transport, inbound_rx))
    }

    async fn accept_connections(
        listener: TcpListener,
        node_id: NodeId,
        config: TcpTransportConfig,
        inbound: mpsc::Sender<InboundRpc>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(node_id = %node_id, "listener stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(node_id = %node_id, peer_addr = %addr, "accepted connection");
                        let node_id = node_id.clone();
                        let config = config.clone();
                        let inbound = inbound.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_inbound_connection(
                                stream, addr, node_id, config, inbound, shutdown,
                            )
                            .await
                            {
                                debug!(peer_addr = %addr, error = %e, "inbound connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(node_id = %node_id, error = %e, "failed to accept connection");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    async fn handle_inbound_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        local_node_id: NodeId,
        config: TcpTransportConfig,
        inbound: mpsc::Sender<InboundRpc>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let peer = Self::perform_inbound_handshake(&mut stream, &local_node_id, &config).await?;
        debug!(node_id = %local_node_id, peer = %peer, peer_addr = %addr, "inbound handshake complete");

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = MessageFrame::from_stream(&mut stream, config.max_message_size) => frame?,
            };
            let request: RpcRequest = frame.decode()?;

            let (reply, response) = oneshot::channel();
            if inbound.send(InboundRpc { request, reply }).await.is_err() {
                return Err(WardenError::network("engine stopped receiving RPCs"));
            }
            // A dropped reply means the engine could not answer; closing the
            // connection fails the caller instead of leaving it waiting.
            let response = response
                .await
                .map_err(|_| WardenError::network("RPC dropped without a response"))?;

            MessageFrame::encode(&response, config.max_message_size)?
                .write_to(&mut stream)
                .await?;
        }
    }

    async fn perform_inbound_handshake(
        stream: &mut TcpStream,
        local_node_id: &NodeId,
        config: &TcpTransportConfig,
    ) -> Result<NodeId> {
        let frame = timeout(
            config.connect_timeout,
            MessageFrame::from_stream(stream, config.max_message_size),
        )
        .await
        .map_err(|_| WardenError::timeout("inbound handshake"))??;
        let peer: NodeId = frame.decode()?;

        MessageFrame::encode(local_node_id, config.max_message_size)?
            .write_to(stream)
            .await?;
        Ok(peer)
    }

    async fn perform_outbound_handshake(
        &self,
        stream: &mut TcpStream,
        expected_peer: &NodeId,
    ) -> Result<()> {
        MessageFrame::encode(&self.node_id, self.config.max_message_size)?
            .write_to(stream)
            .await?;

        let frame = MessageFrame::from_stream(stream, self.config.max_message_size).await?;
        let peer: NodeId = frame.decode()?;
        if &peer != expected_peer {
            return Err(WardenError::network(format!(
                "Node ID mismatch: expected {}, got {}",
                expected_peer, peer
            )));
        }
        Ok(())
    }

    async fn connect(&self, target: &NodeId, address: &str) -> Result<Connection> {
        if let Some(connection) = self.connections.lock().await.get(address) {
            return Ok(connection.clone());
        }

        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| WardenError::timeout(format!("connect to {}", address)))?
            .map_err(|e| WardenError::network(format!("Failed to connect to {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);

        timeout(
            self.config.connect_timeout,
            self.perform_outbound_handshake(&mut stream, target),
        )
        .await
        .map_err(|_| WardenError::timeout(format!("handshake with {}", target)))??;

        debug!(node_id = %self.node_id, peer = %target, address, "connected to peer");

        let connection = Arc::new(Mutex::new(stream));
        self.connections
            .lock()
            .await
            .insert(address.to_string(), connection.clone());
        Ok(connection)
    }

    async fn drop_connection(&self, address: &str, connection: &Connection) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(address)
            .map(|c| Arc::ptr_eq(c, connection))
            .unwrap_or(false)
        {
            connections.remove(address);
        }
    }

    async fn exchange(&self, connection: &Connection, request: &RpcRequest) -> Result<RpcResponse> {
        let mut stream = connection.lock().await;
        MessageFrame::encode(request, self.config.max_message_size)?
            .write_to(&mut *stream)
            .await?;
        let frame = MessageFrame::from_stream(&mut *stream, self.config.max_message_size).await?;
        frame.decode()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    fn local_address(&self) -> &str {
        &self.local_addr
    }

    async fn call(&self, target: &NodeId, address: &str, request: RpcRequest) -> Result<RpcResponse> {
        if self.shutdown.is_cancelled() {
            return Err(WardenError::Shutdown);
        }

        let connection = self.connect(target, address).await?;
        let result = match timeout(self.config.request_timeout, self.exchange(&connection, &request)).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::timeout(format!("{} to {}", request.name(), target))),
        };

        if let Err(e) = &result {
            // The stream may hold a partial frame; start over on the next call
            debug!(node_id = %self.node_id, peer = %target, error = %e, "dropping connection");
            self.drop_connection(address, &connection).await;
        }
        result
    }

    async fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down TCP transport");
        self.shutdown.cancel();
        let mut connections = self.connections.lock().await;
        for address in connections.keys() {
            debug!(address = %address, "Closing connection");
        }
        connections.clear();
    }
}

/// Builds [`TcpTransport`]s with a shared configuration.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn bind(
        &self,
        node_id: &NodeId,
        address: &str,
    ) -> Result<(Arc<dyn RaftTransport>, InboundReceiver)> {
        let (transport, inbound) =
            TcpTransport::bind(node_id.clone(), address, self.config.clone()).await?;
        if transport.local_address() != address {
            warn!(node_id = %node_id, requested = address, bound = transport.local_address(), "bound to an ephemeral port");
        }
        let transport: Arc<dyn RaftTransport> = transport;
        Ok((transport, inbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::messages::{RequestVoteRequest, RequestVoteResponse};

    fn vote_request(candidate: &str) -> RpcRequest {
        RpcRequest::RequestVote(RequestVoteRequest {
            term: 3,
            candidate: NodeId::new(candidate),
            last_log_index: 7,
            last_log_term: 2,
        })
    }

    /// Answers every vote request with a grant in the request's term.
    fn spawn_responder(mut inbound: InboundReceiver) {
        tokio::spawn(async move {
            while let Some(rpc) = inbound.recv().await {
                let term = match &rpc.request {
                    RpcRequest::RequestVote(r) => r.term,
                    _ => 0,
                };
                let _ = rpc.reply.send(RpcResponse::RequestVote(RequestVoteResponse {
                    term,
                    granted: true,
                }));
            }
        });
    }

    #[tokio::test]
    async fn test_message_frame() {
        let payload = Bytes::from("test message");
        let frame = MessageFrame::new(payload.clone(), 1024).unwrap();

        assert_eq!(frame.length, payload.len() as u32);
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.to_bytes().len(), 4 + payload.len());

        assert!(MessageFrame::new(Bytes::from(vec![0u8; 2048]), 1024).is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let (transport, _inbound) =
            TcpTransport::bind(NodeId::new("a"), "127.0.0.1:0", TcpTransportConfig::default())
                .await
                .unwrap();
        assert!(transport.local_address().starts_with("127.0.0.1:"));
        assert!(!transport.local_address().ends_with(":0"));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_response() {
        let config = TcpTransportConfig::default();
        let (a, _a_inbound) = TcpTransport::bind(NodeId::new("a"), "127.0.0.1:0", config.clone())
            .await
            .unwrap();
        let (b, b_inbound) = TcpTransport::bind(NodeId::new("b"), "127.0.0.1:0", config)
            .await
            .unwrap();
        spawn_responder(b_inbound);

        for _ in 0..3 {
            let response = a
                .call(&NodeId::new("b"), b.local_address(), vote_request("a"))
                .await
                .unwrap();
            assert_eq!(
                response,
                RpcResponse::RequestVote(RequestVoteResponse {
                    term: 3,
                    granted: true
                })
            );
        }
        assert_eq!(a.connections.lock().await.len(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_node() {
        let config = TcpTransportConfig::default();
        let (a, _a_inbound) = TcpTransport::bind(NodeId::new("a"), "127.0.0.1:0", config.clone())
            .await
            .unwrap();
        let (b, b_inbound) = TcpTransport::bind(NodeId::new("b"), "127.0.0.1:0", config)
            .await
            .unwrap();
        spawn_responder(b_inbound);

        let err = a
            .call(&NodeId::new("c"), b.local_address(), vote_request("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Network { .. }));
    }

    #[tokio::test]
    async fn test_call_to_closed_port_fails() {
        let (a, _inbound) = TcpTransport::bind(
            NodeId::new("a"),
            "127.0.0.1:0",
            TcpTransportConfig {
                connect_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Reserve a port, then release it so nothing is listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(a.call(&NodeId::new("b"), &address, vote_request("a")).await.is_err());
        a.shutdown().await;
        assert!(matches!(
            a.call(&NodeId::new("b"), &address, vote_request("a")).await,
            Err(WardenError::Shutdown)
        ));
    }
}

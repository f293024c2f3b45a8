//! Integration tests for the TCP transport with real sockets

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::try_init;

use warden_core::messages::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RpcRequest, RpcResponse,
};
use warden_core::network::{InboundReceiver, RaftTransport, TransportFactory};
use warden_core::NodeId;
use warden_network::{TcpTransportConfig, TcpTransportFactory};

/// Acknowledges every append, reporting the index of the last entry received.
fn spawn_follower(mut inbound: InboundReceiver) {
    tokio::spawn(async move {
        while let Some(rpc) = inbound.recv().await {
            if let RpcRequest::AppendEntries(req) = rpc.request {
                let last = req
                    .entries
                    .last()
                    .map(|e| e.index)
                    .unwrap_or(req.prev_log_index);
                let _ = rpc.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                    term: req.term,
                    success: true,
                    last_log_index: last,
                }));
            }
        }
    });
}

fn append(leader: &str, prev: u64, count: u64) -> RpcRequest {
    RpcRequest::AppendEntries(AppendEntriesRequest {
        term: 2,
        leader: NodeId::new(leader),
        prev_log_index: prev,
        prev_log_term: 1,
        entries: (prev + 1..=prev + count).map(|i| LogEntry::blank(i, 2)).collect(),
        leader_commit: prev,
    })
}

#[tokio::test]
async fn test_three_node_mesh() {
    let _ = try_init();

    let factory = TcpTransportFactory::new(TcpTransportConfig::default());
    let mut transports: Vec<(NodeId, Arc<dyn RaftTransport>)> = Vec::new();
    for id in ["a", "b", "c"] {
        let node = NodeId::new(id);
        let (transport, inbound) = tokio_test::assert_ok!(factory.bind(&node, "127.0.0.1:0").await);
        info!("{} listening on {}", id, transport.local_address());
        spawn_follower(inbound);
        transports.push((node, transport));
    }

    let mut calls = Vec::new();
    for (from, transport) in &transports {
        for (to, target) in &transports {
            if from == to {
                continue;
            }
            let transport = transport.clone();
            let to = to.clone();
            let address = target.local_address().to_string();
            let request = append(from.as_str(), 4, 3);
            calls.push(tokio::spawn(async move {
                transport.call(&to, &address, request).await
            }));
        }
    }

    for call in calls {
        match call.await.unwrap().unwrap() {
            RpcResponse::AppendEntries(response) => {
                assert!(response.success);
                assert_eq!(response.last_log_index, 7);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    for (_, transport) in &transports {
        transport.shutdown().await;
    }
}

#[tokio::test]
async fn test_reconnects_after_peer_restart() {
    let _ = try_init();

    let config = TcpTransportConfig {
        connect_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let factory = TcpTransportFactory::new(config);

    let (a, _a_inbound) = factory.bind(&NodeId::new("a"), "127.0.0.1:0").await.unwrap();
    let (b, b_inbound) = factory.bind(&NodeId::new("b"), "127.0.0.1:0").await.unwrap();
    let b_address = b.local_address().to_string();
    spawn_follower(b_inbound);

    a.call(&NodeId::new("b"), &b_address, append("a", 0, 1))
        .await
        .unwrap();

    // Stop b; the cached connection now fails and is discarded
    b.shutdown().await;
    drop(b);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a
        .call(&NodeId::new("b"), &b_address, append("a", 1, 1))
        .await
        .is_err());

    // Bring b back on the same address
    let (b, b_inbound) = factory.bind(&NodeId::new("b"), &b_address).await.unwrap();
    spawn_follower(b_inbound);
    let response = a
        .call(&NodeId::new("b"), &b_address, append("a", 1, 1))
        .await
        .unwrap();
    assert_eq!(response.term(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

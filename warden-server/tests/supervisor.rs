//! Single-node lifecycle of the supervisor.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warden_leader::ManagerState;
use warden_server::config::WardenConfig;
use warden_server::Warden;

fn config(store: &std::path::Path, plugins: &str) -> WardenConfig {
    let text = format!(
        r#"{{
            "id": "solo",
            "listen": "127.0.0.1:0",
            "store": {store:?},
            "initial_cluster": {{"solo": "127.0.0.1:0"}},
            "plugins": {plugins},
            "raft": {{"heartbeat_interval_ms": 30, "election_timeout_ms": 200}}
        }}"#,
        store = store.display().to_string(),
        plugins = plugins,
    );
    WardenConfig::from_slice(text.as_bytes()).unwrap()
}

async fn http_get(address: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(address).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, address
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_start_serve_and_stop() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    let metadata = dir.path().join("metadata.json");

    let mut warden = Warden::new(config(dir.path(), r#"["metadata"]"#)).unwrap();
    tokio_test::assert_ok!(warden.start().await);
    let api = warden.api_address().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(body) = tokio::fs::read(&metadata).await {
                if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
                    if json["leader"] == "solo" {
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metadata never named the leader");

    let response = http_get(api, "/status").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"leader_id\": \"solo\""));

    warden.stop().await;
    assert_eq!(warden.manager().state(), ManagerState::Stopped);
    assert!(warden.api_address().is_none());
    // The metadata plugin cleans up on shutdown
    assert!(!metadata.exists());

    // Stopping twice is harmless
    warden.stop().await;
}

#[tokio::test]
async fn test_plugin_setup_failure_aborts_start() {
    let dir = tempfile::tempdir().unwrap();
    // virtual_ip without its section cannot set up
    let mut warden = Warden::new(config(dir.path(), r#"["virtual_ip"]"#)).unwrap();

    let err = warden.start().await.unwrap_err();
    assert!(err.to_string().contains("virtual_ip"));
    assert_eq!(warden.manager().state(), ManagerState::Stopped);
    assert!(warden.api_address().is_none());
}

#[tokio::test]
async fn test_restart_rejoins_from_store() {
    let dir = tempfile::tempdir().unwrap();

    let mut first = Warden::new(config(dir.path(), "[]")).unwrap();
    first.start().await.unwrap();
    first.stop().await;

    let mut second = Warden::new(config(dir.path(), "[]")).unwrap();
    second.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !second
            .manager()
            .status()
            .map(|s| s.is_leader())
            .unwrap_or(false)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rejoined node never became leader");
    second.stop().await;
}

//! Management API: cluster status and membership over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use warden_core::NodeId;
use warden_leader::{ConsensusManager, LeaderError};

/// Error response carrying the status derived from a [`LeaderError`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<LeaderError> for ApiError {
    fn from(err: LeaderError) -> Self {
        let status = match &err {
            LeaderError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            LeaderError::AddressConflict { .. } => StatusCode::CONFLICT,
            LeaderError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            LeaderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MemberQuery {
    address: Option<String>,
}

/// Routes served on the `listen` address.
pub fn router(manager: Arc<ConsensusManager>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/member/:id", post(add_member).delete(del_member))
        .with_state(manager)
}

async fn status(State(manager): State<Arc<ConsensusManager>>) -> Result<Response, ApiError> {
    let state = manager.status()?;
    let body = serde_json::to_string_pretty(&state).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
    })?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn add_member(
    State(manager): State<Arc<ConsensusManager>>,
    Path(id): Path<String>,
    Query(query): Query<MemberQuery>,
) -> Result<StatusCode, ApiError> {
    let address = match query.address {
        Some(address) if !address.is_empty() => address,
        _ => return Err(ApiError::bad_request("address query parameter is required")),
    };

    match manager
        .add_member(NodeId::new(id.clone()), address.clone(), true)
        .await
    {
        Ok(()) => {
            info!(member = %id, address = %address, "add member request completed");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            error!(member = %id, address = %address, error = %e, "add member request failed");
            Err(e.into())
        }
    }
}

async fn del_member(
    State(manager): State<Arc<ConsensusManager>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match manager.del_member(NodeId::new(id.clone())).await {
        Ok(()) => {
            info!(member = %id, "delete member request completed");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            error!(member = %id, error = %e, "delete member request failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;
    use warden_core::ClusterState;
    use warden_engine::RaftConfig;
    use warden_network::TcpTransportFactory;

    fn manager() -> Arc<ConsensusManager> {
        Arc::new(
            ConsensusManager::new(
                NodeId::new("a"),
                RaftConfig::fast(),
                Arc::new(TcpTransportFactory::default()),
            )
            .unwrap(),
        )
    }

    async fn running(dir: &std::path::Path) -> Arc<ConsensusManager> {
        let manager = manager();
        let mut peers = BTreeMap::new();
        peers.insert(NodeId::new("a"), "127.0.0.1:0".to_string());
        manager.init_or_join(&peers, dir).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.status().map(|s| s.is_leader()).unwrap_or(false) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("single node never became leader");
        manager
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_uninitialized_manager_is_unavailable() {
        let app = router(manager());
        let (status, body) = send(app.clone(), Method::GET, "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not initialized"));

        let (status, _) = send(app, Method::DELETE, "/member/b").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_add_requires_address() {
        let app = router(manager());
        let (status, body) = send(app.clone(), Method::POST, "/member/b").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(app, Method::POST, "/member/b?address=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_membership() {
        let dir = tempfile::tempdir().unwrap();
        let manager = running(dir.path()).await;
        let own_address = manager.status().unwrap().members[0].address.clone();
        let app = router(manager.clone());

        let (status, body) = send(app.clone(), Method::GET, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let state: ClusterState = serde_json::from_value(body).unwrap();
        assert_eq!(state.leader_id, Some(NodeId::new("a")));
        assert_eq!(state.members.len(), 1);

        // Already a member
        let uri = format!("/member/a?address={}", own_address);
        let (status, _) = send(app.clone(), Method::POST, &uri).await;
        assert_eq!(status, StatusCode::OK);

        let uri = format!("/member/b?address={}", own_address);
        let (status, body) = send(app.clone(), Method::POST, &uri).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already used"));

        // Not a member
        let (status, _) = send(app.clone(), Method::DELETE, "/member/zz").await;
        assert_eq!(status, StatusCode::OK);

        // Nobody answers for b, so the leader loses its quorum and steps down
        let (status, body) = send(app, Method::POST, "/member/b?address=127.0.0.1:1").await;
        assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Not the leader"));

        manager.shutdown().await;
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (LeaderError::NotLeader { leader: None }, StatusCode::MISDIRECTED_REQUEST),
            (
                LeaderError::AddressConflict {
                    id: NodeId::new("b"),
                    address: "10.0.0.1:7300".to_string(),
                    existing: NodeId::new("a"),
                },
                StatusCode::CONFLICT,
            ),
            (LeaderError::NotInitialized, StatusCode::SERVICE_UNAVAILABLE),
            (
                LeaderError::Timeout {
                    operation: "add member b".to_string(),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                LeaderError::Internal {
                    reason: "boom".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}

//! Publishes the cluster view as `metadata.json` in the store directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use warden_core::{ClusterState, NodeId, Observation, ObservationFilter};

use crate::plugin::{ClusterStatus, Plugin, PluginContext, PluginError, PluginResult};

pub const NAME: &str = "metadata";
pub const OUTPUT_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub address: String,
    pub voter: bool,
    /// Set for the peer a failed heartbeat was just reported for. Only the
    /// leader sends heartbeats, so followers never set it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub offline: bool,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Empty while no leader is known.
    pub leader: String,
    pub members: Vec<MemberStatus>,
}

impl Metadata {
    pub fn from_state(state: &ClusterState, observation: &Observation) -> Self {
        let offline_peer = match observation {
            Observation::FailedHeartbeat { peer, .. } => Some(peer),
            _ => None,
        };
        Self {
            leader: state
                .leader_id
                .as_ref()
                .map(|l| l.to_string())
                .unwrap_or_default(),
            members: state
                .members
                .iter()
                .map(|m| MemberStatus {
                    id: m.id.clone(),
                    address: m.address.clone(),
                    voter: m.voter,
                    offline: offline_peer == Some(&m.id),
                })
                .collect(),
        }
    }
}

/// Rewrites `metadata.json` after every observation.
#[derive(Default)]
pub struct MetadataPlugin {
    output: Option<PathBuf>,
    cluster: Option<Arc<dyn ClusterStatus>>,
}

impl MetadataPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    async fn write(path: &Path, metadata: &Metadata) -> PluginResult<()> {
        let body = serde_json::to_vec_pretty(metadata)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for MetadataPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn setup(&mut self, ctx: &PluginContext) -> PluginResult<()> {
        self.output = Some(ctx.store_path.join(OUTPUT_FILE));
        self.cluster = Some(ctx.cluster.clone());
        Ok(())
    }

    fn filter(&self) -> ObservationFilter {
        ObservationFilter::All
    }

    async fn handle(&mut self, observation: &Observation) -> PluginResult<()> {
        let (Some(output), Some(cluster)) = (&self.output, &self.cluster) else {
            return Err(PluginError::config("metadata plugin used before setup"));
        };
        let state = cluster.cluster_state()?;
        let metadata = Metadata::from_state(&state, observation);
        Self::write(output, &metadata).await?;
        debug!(plugin = NAME, path = %output.display(), members = metadata.members.len(), "metadata written");
        Ok(())
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        let Some(output) = &self.output else {
            return Ok(());
        };
        match tokio::fs::remove_file(output).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeaderResult;
    use parking_lot::Mutex;
    use warden_core::{ClusterMember, RaftRole};

    struct SharedStatus(Mutex<ClusterState>);

    impl ClusterStatus for SharedStatus {
        fn cluster_state(&self) -> LeaderResult<ClusterState> {
            Ok(self.0.lock().clone())
        }
    }

    fn state(leader: Option<&str>) -> ClusterState {
        ClusterState {
            members: vec![
                ClusterMember::voter("a", "10.0.0.1:7300"),
                ClusterMember::voter("b", "10.0.0.2:7300"),
                ClusterMember::nonvoter("c", "10.0.0.3:7300"),
            ],
            id: NodeId::new("a"),
            leader_id: leader.map(NodeId::new),
            status: RaftRole::Leader,
            term: 4,
        }
    }

    async fn setup(dir: &Path, leader: Option<&str>) -> MetadataPlugin {
        let ctx = PluginContext {
            node_id: NodeId::new("a"),
            store_path: dir.to_path_buf(),
            raw_config: Arc::from(&b"{}"[..]),
            cluster: Arc::new(SharedStatus(Mutex::new(state(leader)))),
        };
        let mut plugin = MetadataPlugin::new();
        plugin.setup(&ctx).await.unwrap();
        plugin
    }

    async fn read(dir: &Path) -> serde_json::Value {
        let body = tokio::fs::read(dir.join(OUTPUT_FILE)).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_writes_members_and_leader() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = setup(dir.path(), Some("a")).await;

        plugin
            .handle(&Observation::LeaderChange {
                leader: Some(NodeId::new("a")),
                term: 4,
            })
            .await
            .unwrap();

        let json = read(dir.path()).await;
        assert_eq!(json["leader"], "a");
        assert_eq!(json["members"].as_array().unwrap().len(), 3);
        assert_eq!(json["members"][2]["voter"], false);
        // Omitted unless set
        assert!(json["members"][0].get("offline").is_none());
    }

    #[tokio::test]
    async fn test_failed_heartbeat_marks_peer_offline() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = setup(dir.path(), Some("a")).await;

        plugin
            .handle(&Observation::FailedHeartbeat {
                peer: NodeId::new("b"),
                failures: 1,
            })
            .await
            .unwrap();
        let json = read(dir.path()).await;
        assert_eq!(json["members"][1]["offline"], true);
        assert!(json["members"][0].get("offline").is_none());

        plugin
            .handle(&Observation::ResumedHeartbeat {
                peer: NodeId::new("b"),
            })
            .await
            .unwrap();
        let json = read(dir.path()).await;
        assert!(json["members"][1].get("offline").is_none());
    }

    #[tokio::test]
    async fn test_unknown_leader_is_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = setup(dir.path(), None).await;
        plugin
            .handle(&Observation::LeaderChange { leader: None, term: 5 })
            .await
            .unwrap();
        assert_eq!(read(dir.path()).await["leader"], "");
    }

    #[tokio::test]
    async fn test_shutdown_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = setup(dir.path(), Some("a")).await;
        plugin
            .handle(&Observation::LeaderChange {
                leader: Some(NodeId::new("a")),
                term: 4,
            })
            .await
            .unwrap();
        assert!(dir.path().join(OUTPUT_FILE).exists());

        plugin.shutdown().await.unwrap();
        assert!(!dir.path().join(OUTPUT_FILE).exists());
        // Missing file is fine
        plugin.shutdown().await.unwrap();
    }
}

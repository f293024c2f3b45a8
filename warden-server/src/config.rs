//! Configuration loading and types for a Warden node.
//!
//! The configuration is a JSON file deserialized into [`WardenConfig`]. The
//! bytes read are kept alongside the parsed value so plugins can read their
//! own sections (for example `virtual_ip`) without the core knowing them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use warden_core::NodeId;
use warden_engine::RaftConfig;
use warden_leader::plugins::{virtual_ip, BUILTIN_PLUGINS};

/// Errors raised while loading or validating the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Identity of this node. Defaults to the host name.
    #[serde(default = "default_id")]
    pub id: NodeId,

    /// Bind address of the management API.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory holding the consensus log and snapshots.
    #[serde(default)]
    pub store: PathBuf,

    /// Founding members, used only when the store is empty.
    #[serde(default)]
    pub initial_cluster: BTreeMap<NodeId, String>,

    #[serde(default)]
    pub raft_log: RaftLogConfig,

    /// Address held by the leader, if any.
    #[serde(default)]
    pub floating: Option<FloatingConfig>,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Built-in plugins to start, in order.
    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub raft: RaftTimings,

    /// The file exactly as read.
    #[serde(skip, default = "empty_raw")]
    pub raw: Arc<[u8]>,
}

/// Where engine records go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftLogConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_raft_log_output")]
    pub output: PathBuf,

    #[serde(default = "default_raft_log_level")]
    pub level: String,
}

impl Default for RaftLogConfig {
    fn default() -> Self {
        Self {
            enable: false,
            output: default_raft_log_output(),
            level: default_raft_log_level(),
        }
    }
}

/// Floating address descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingConfig {
    pub iface: String,
    /// `ip[/prefix]`
    pub address: String,
    #[serde(rename = "type", default = "default_floating_type")]
    pub kind: String,
}

/// Engine timings. Unset values keep the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftTimings {
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    pub election_timeout_ms: Option<u64>,
}

fn default_id() -> NodeId {
    NodeId::new(hostname())
}

fn default_listen() -> String {
    "0.0.0.0:8300".to_string()
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

fn default_raft_log_output() -> PathBuf {
    PathBuf::from("/var/log/warden/raft.log")
}

fn default_raft_log_level() -> String {
    "info".to_string()
}

fn default_floating_type() -> String {
    "alias".to_string()
}

fn empty_raw() -> Arc<[u8]> {
    Arc::from(Vec::new())
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Reads, parses and validates the configuration at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<WardenConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    WardenConfig::from_slice(&raw)
}

impl WardenConfig {
    /// Parses and validates configuration bytes, keeping a copy of them.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: WardenConfig = serde_json::from_slice(raw)?;
        config.raw = Arc::from(raw);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::invalid("id must not be empty"));
        }
        if self.store.as_os_str().is_empty() {
            return Err(ConfigError::invalid("store must be set"));
        }
        if self.initial_cluster.is_empty() {
            return Err(ConfigError::invalid("initial_cluster must list at least one member"));
        }
        if let Some((id, _)) = self.initial_cluster.iter().find(|(_, a)| a.is_empty()) {
            return Err(ConfigError::invalid(format!(
                "initial_cluster entry {} has no address",
                id
            )));
        }

        if let Some(floating) = &self.floating {
            if floating.kind != "alias" {
                return Err(ConfigError::invalid(format!(
                    "unsupported floating type '{}'",
                    floating.kind
                )));
            }
            if floating.iface.is_empty() || floating.address.is_empty() {
                return Err(ConfigError::invalid("floating requires both iface and address"));
            }
            if self.plugins.iter().any(|p| p == virtual_ip::NAME) {
                return Err(ConfigError::invalid(
                    "floating and the virtual_ip plugin cannot both manage an address",
                ));
            }
        }

        let mut seen = Vec::new();
        for plugin in &self.plugins {
            if !BUILTIN_PLUGINS.contains(&plugin.as_str()) {
                return Err(ConfigError::invalid(format!("unknown plugin '{}'", plugin)));
            }
            if seen.contains(&plugin) {
                return Err(ConfigError::invalid(format!("plugin '{}' listed twice", plugin)));
            }
            seen.push(plugin);
        }

        if self.reconcile_interval_ms == 0 {
            return Err(ConfigError::invalid("reconcile_interval_ms must be positive"));
        }
        let raft = self.raft_config();
        if raft.heartbeat_interval >= raft.election_timeout {
            return Err(ConfigError::invalid(
                "raft heartbeat interval must be shorter than the election timeout",
            ));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Engine configuration with the configured timings applied.
    pub fn raft_config(&self) -> RaftConfig {
        let mut config = RaftConfig::default();
        if let Some(ms) = self.raft.heartbeat_interval_ms {
            config = config.with_heartbeat_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.raft.election_timeout_ms {
            let election = Duration::from_millis(ms);
            // Step down well before followers start an election
            config = config
                .with_election_timeout(election)
                .with_leader_lease_timeout(election * 3 / 4);
        }
        config
    }
}

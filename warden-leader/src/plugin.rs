//! Plugin contract and the registry built once at startup.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use warden_core::{ClusterState, NodeId, Observation, ObservationFilter, WardenError};

use crate::{LeaderError, LeaderResult};

/// Result type for plugin hooks
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors raised by plugin hooks
#[derive(Error, Debug)]
pub enum PluginError {
    /// The plugin's configuration section is missing or invalid
    #[error("Plugin configuration error: {reason}")]
    Config { reason: String },

    /// Cluster state could not be read
    #[error("Cluster status unavailable: {reason}")]
    Cluster { reason: String },

    /// Network configurator failure
    #[error("Network error: {0}")]
    Network(#[from] WardenError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    pub fn config(reason: impl Into<String>) -> Self {
        PluginError::Config {
            reason: reason.into(),
        }
    }
}

impl From<LeaderError> for PluginError {
    fn from(err: LeaderError) -> Self {
        PluginError::Cluster {
            reason: err.to_string(),
        }
    }
}

/// Read access to the cluster for plugins.
pub trait ClusterStatus: Send + Sync {
    fn cluster_state(&self) -> LeaderResult<ClusterState>;
}

/// Everything a plugin may need during setup.
#[derive(Clone)]
pub struct PluginContext {
    pub node_id: NodeId,
    /// Directory of the durable store.
    pub store_path: PathBuf,
    /// The configuration file exactly as read, for plugin-private sections.
    pub raw_config: Arc<[u8]>,
    pub cluster: Arc<dyn ClusterStatus>,
}

/// A handler for engine observations.
///
/// `setup` runs once before the plugin receives anything. `handle` calls
/// are sequential for one plugin. `shutdown` runs exactly once, after the
/// last `handle`.
#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &str;

    async fn setup(&mut self, ctx: &PluginContext) -> PluginResult<()>;

    /// Evaluated by the engine before an observation is queued.
    fn filter(&self) -> ObservationFilter;

    async fn handle(&mut self, observation: &Observation) -> PluginResult<()>;

    async fn shutdown(&mut self) -> PluginResult<()>;
}

/// Plugins to run, fixed at construction.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    /// Rejects unnamed plugins and duplicate names.
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> LeaderResult<Self> {
        let mut names = HashSet::new();
        for plugin in &plugins {
            let name = plugin.name();
            if name.is_empty() {
                return Err(LeaderError::config("plugin must have a name"));
            }
            if !names.insert(name.to_string()) {
                return Err(LeaderError::DuplicatePlugin {
                    name: name.to_string(),
                });
            }
        }
        Ok(Self { plugins })
    }

    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn into_plugins(self) -> Vec<Box<dyn Plugin>> {
        self.plugins
    }
}

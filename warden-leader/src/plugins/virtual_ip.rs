//! Holds a virtual address on the leader, driven by observations.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use warden_core::configurator::NetworkConfigurator;
use warden_core::{NodeId, Observation, ObservationFilter};
use warden_network::AliasConfigurator;

use crate::plugin::{ClusterStatus, Plugin, PluginContext, PluginError, PluginResult};

pub const NAME: &str = "virtual_ip";

/// The `virtual_ip` section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualIpConfig {
    #[serde(default)]
    pub iface: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Deserialize)]
struct Section {
    #[serde(default)]
    virtual_ip: VirtualIpConfig,
}

impl VirtualIpConfig {
    /// Reads the section out of the raw configuration file.
    pub fn from_raw(raw: &[u8]) -> PluginResult<Self> {
        let section: Section = serde_json::from_slice(raw)?;
        let config = section.virtual_ip;
        if config.iface.is_empty() || config.address.is_empty() {
            return Err(PluginError::config(
                "virtual_ip requires both iface and address",
            ));
        }
        Ok(config)
    }
}

/// Adds the address when this node is leader and removes it otherwise.
#[derive(Default)]
pub struct VirtualIpPlugin {
    node_id: Option<NodeId>,
    configurator: Option<Arc<dyn NetworkConfigurator>>,
    cluster: Option<Arc<dyn ClusterStatus>>,
}

impl VirtualIpPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `configurator` instead of building one from the configuration.
    pub fn with_configurator(configurator: Arc<dyn NetworkConfigurator>) -> Self {
        Self {
            configurator: Some(configurator),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Plugin for VirtualIpPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn setup(&mut self, ctx: &PluginContext) -> PluginResult<()> {
        self.node_id = Some(ctx.node_id.clone());
        self.cluster = Some(ctx.cluster.clone());
        if self.configurator.is_none() {
            let config = VirtualIpConfig::from_raw(&ctx.raw_config)?;
            let configurator = AliasConfigurator::new(&config.address, &config.iface).await?;
            self.configurator = Some(Arc::new(configurator));
        }
        Ok(())
    }

    fn filter(&self) -> ObservationFilter {
        ObservationFilter::All
    }

    async fn handle(&mut self, _observation: &Observation) -> PluginResult<()> {
        let (Some(node_id), Some(configurator), Some(cluster)) =
            (&self.node_id, &self.configurator, &self.cluster)
        else {
            return Err(PluginError::config("virtual_ip plugin used before setup"));
        };

        let state = cluster.cluster_state()?;
        let is_leader = state.leader_id.as_ref() == Some(node_id);
        let is_set = configurator.is_set().await?;

        match (is_set, is_leader) {
            (false, true) => {
                info!(plugin = NAME, "add virtual ip");
                configurator.add_ip().await?;
            }
            (true, false) => {
                info!(plugin = NAME, "delete virtual ip");
                configurator.delete_ip().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> PluginResult<()> {
        if let Some(configurator) = &self.configurator {
            configurator.delete_ip().await?;
        }
        Ok(())
    }
}

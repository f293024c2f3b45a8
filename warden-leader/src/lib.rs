//! # Warden Leader
//!
//! Everything that consumes the consensus engine on a Warden node:
//!
//! - **ConsensusManager**: bootstrap or rejoin, cluster status and the
//!   serialized membership API
//! - **ObserverDispatcher**: one worker per plugin, fed by filtered engine
//!   observations
//! - **ReconciliationLoop**: holds the floating address while this node is
//!   leader and repairs drift
//! - **Built-in plugins**: `metadata` and `virtual_ip`

pub mod dispatcher;
pub mod errors;
pub mod floating;
pub mod manager;
pub mod plugin;
pub mod plugins;

pub use dispatcher::{ObservationSource, ObserverDispatcher, PLUGIN_CHANNEL_CAPACITY};
pub use errors::{LeaderError, LeaderResult};
pub use floating::{FloatingHandle, ReconciliationLoop, ResourceState, DEFAULT_RECONCILE_INTERVAL};
pub use manager::{ConsensusManager, ManagerState, MEMBER_OPERATION_TIMEOUT};
pub use plugin::{
    ClusterStatus, Plugin, PluginContext, PluginError, PluginRegistry, PluginResult,
};

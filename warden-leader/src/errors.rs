//! Error types for the consensus manager, plugin dispatch and the
//! reconciliation loop.

use thiserror::Error;
use warden_core::{NodeId, WardenError};

/// Result type for leader-side operations
pub type LeaderResult<T> = Result<T, LeaderError>;

/// Errors returned by the consensus manager and its consumers
#[derive(Error, Debug)]
pub enum LeaderError {
    /// The engine has not been started or has been shut down
    #[error("Consensus engine is not initialized")]
    NotInitialized,

    /// `init_or_join` was called twice
    #[error("Consensus engine is already initialized")]
    AlreadyInitialized,

    /// Bootstrap requires this node in the initial peer set
    #[error("Self {node_id} not in initial peer set")]
    SelfNotInInitialPeers { node_id: NodeId },

    /// Rejoin found a persisted configuration without this node
    #[error("Node {node_id} is not a member of the existing cluster")]
    NotClusterMember { node_id: NodeId },

    /// Membership changes must be sent to the leader
    #[error("Not the leader (current leader: {})", leader.as_ref().map(NodeId::as_str).unwrap_or("unknown"))]
    NotLeader { leader: Option<NodeId> },

    /// The address already belongs to another member
    #[error("Address {address} of {id} is already used by {existing}")]
    AddressConflict {
        id: NodeId,
        address: String,
        existing: NodeId,
    },

    /// A membership change did not complete in time
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// A plugin failed to set up
    #[error("Plugin {name} setup failed: {reason}")]
    PluginSetup { name: String, reason: String },

    /// Two plugins registered under the same name
    #[error("Duplicate plugin name: {name}")]
    DuplicatePlugin { name: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// Error raised by the consensus engine or its store
    #[error("Engine error: {0}")]
    Engine(#[from] WardenError),

    /// Internal system error
    #[error("Internal system error: {reason}")]
    Internal { reason: String },
}

impl LeaderError {
    pub fn config(reason: impl Into<String>) -> Self {
        LeaderError::ConfigError {
            reason: reason.into(),
        }
    }

    /// Maps engine errors that callers act on onto this taxonomy.
    ///
    /// A leadership change between the manager's own check and the engine
    /// applying the change surfaces as `NotLeader`.
    pub fn from_engine(err: WardenError) -> Self {
        match err {
            WardenError::NotLeader { leader } => LeaderError::NotLeader { leader },
            WardenError::Timeout { operation } => LeaderError::Timeout { operation },
            other => LeaderError::Engine(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_are_mapped() {
        let err = LeaderError::from_engine(WardenError::NotLeader {
            leader: Some(NodeId::new("b")),
        });
        assert!(matches!(err, LeaderError::NotLeader { leader: Some(_) }));

        let err = LeaderError::from_engine(WardenError::timeout("add member"));
        assert!(matches!(err, LeaderError::Timeout { .. }));

        let err = LeaderError::from_engine(WardenError::ConfigChangeInProgress);
        assert!(matches!(err, LeaderError::Engine(_)));
    }
}

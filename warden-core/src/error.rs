//! # Error Types
//!
//! Error handling shared by the consensus engine, transports and stores.

use crate::NodeId;
use thiserror::Error;

/// Error types that can occur inside the consensus stack.
///
/// Callers of membership operations see these through the leader crate,
/// which maps the caller-relevant variants (`NotLeader`, `Timeout`) onto its
/// own taxonomy. Background loops only log them.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Network communication failure between nodes
    #[error("Network error: {message}")]
    Network { message: String },

    /// Durable store operation failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Protocol violation or unexpected engine condition
    #[error("Consensus error: {message}")]
    Consensus { message: String },

    /// The request must be served by the leader
    #[error("Node is not the leader (current leader: {})", leader.as_ref().map(NodeId::as_str).unwrap_or("unknown"))]
    NotLeader { leader: Option<NodeId> },

    /// A configuration entry is still waiting to be committed
    #[error("A configuration change is already in progress")]
    ConfigChangeInProgress,

    /// Bootstrap was attempted on a store that already has state
    #[error("Bootstrap only works on new clusters: {details}")]
    CantBootstrap { details: String },

    /// Data integrity check failed due to checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// State corruption detected in persistent storage
    #[error("State corruption detected: {details}")]
    StateCorruption { details: String },

    /// Operation exceeded its timeout limit
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// The engine has been stopped
    #[error("Engine is shut down")]
    Shutdown,

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system or network I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the Warden consensus stack.
pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// Creates a new network error with the given message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new persistence error with the given message.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Creates a new consensus error with the given message.
    pub fn consensus(message: impl Into<String>) -> Self {
        Self::Consensus {
            message: message.into(),
        }
    }

    /// Creates a new timeout error naming the operation that expired.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

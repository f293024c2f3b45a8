//! Transient engine events exposed to external observers.

use crate::{Configuration, NodeId, RaftRole};
use std::fmt;
use std::sync::Arc;

/// An event emitted by the consensus engine. Observations are never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The known leader changed; `None` while no leader is known.
    LeaderChange { leader: Option<NodeId>, term: u64 },
    /// The local role changed.
    RoleChange { role: RaftRole, term: u64 },
    /// The leader failed to reach `peer`. Emitted once per outage.
    FailedHeartbeat { peer: NodeId, failures: u64 },
    /// The leader reached `peer` again after a failure.
    ResumedHeartbeat { peer: NodeId },
    /// The latest cluster configuration changed.
    PeerConfigurationChange { configuration: Configuration },
}

impl Observation {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Observation::LeaderChange { .. } | Observation::RoleChange { .. } => {
                ObservationKind::Leadership
            }
            Observation::FailedHeartbeat { .. } | Observation::ResumedHeartbeat { .. } => {
                ObservationKind::Heartbeat
            }
            Observation::PeerConfigurationChange { .. } => ObservationKind::Configuration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationKind {
    Leadership,
    Heartbeat,
    Configuration,
}

/// Predicate applied on the producer side before an observation is queued.
#[derive(Clone)]
pub enum ObservationFilter {
    All,
    Kind(ObservationKind),
    Custom(Arc<dyn Fn(&Observation) -> bool + Send + Sync>),
}

impl ObservationFilter {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Observation) -> bool + Send + Sync + 'static,
    {
        ObservationFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, observation: &Observation) -> bool {
        match self {
            ObservationFilter::All => true,
            ObservationFilter::Kind(kind) => observation.kind() == *kind,
            ObservationFilter::Custom(predicate) => predicate(observation),
        }
    }
}

impl fmt::Debug for ObservationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationFilter::All => f.write_str("All"),
            ObservationFilter::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            ObservationFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

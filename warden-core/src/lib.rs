//! # Warden Core
//!
//! Shared building blocks for the Warden floating-IP failover system.
//!
//! ## Components
//!
//! - **Cluster types**: [`NodeId`], [`ClusterMember`], [`Configuration`] and
//!   the [`ClusterState`] read snapshot
//! - **Observations**: transient engine events and the producer-side
//!   [`ObservationFilter`]
//! - **Raft messages**: log entries and the RPCs exchanged between engines
//! - **Extension traits**: [`network::RaftTransport`],
//!   [`persistence::PersistenceLayer`], [`state_machine::StateMachine`] and
//!   [`configurator::NetworkConfigurator`]
//! - **Error handling**: [`WardenError`] and the [`Result`] alias

pub mod configurator;
pub mod error;
pub mod messages;
pub mod network;
pub mod observation;
pub mod persistence;
pub mod state_machine;
pub mod types;

pub use error::*;
pub use observation::{Observation, ObservationFilter, ObservationKind};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LogEntry;
    use crate::state_machine::{NoopStateMachine, Snapshot, StateMachine};

    #[tokio::test]
    async fn test_noop_state_machine_only_tracks_index() {
        let mut sm = NoopStateMachine::new();
        tokio_test::assert_ok!(sm.apply(&LogEntry::blank(7, 2)).await);
        assert_eq!(sm.last_applied(), 7);
        assert!(sm.snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_checksum() {
        let mut snapshot = Snapshot::new(10, 3, Configuration::default(), &b"image"[..]);
        assert!(snapshot.verify_checksum());

        snapshot.data = bytes::Bytes::from_static(b"other");
        assert!(!snapshot.verify_checksum());
    }

    #[test]
    fn test_error_types() {
        let error = WardenError::network("test error");
        assert!(error.to_string().contains("test error"));

        let error = WardenError::NotLeader {
            leader: Some(NodeId::new("b")),
        };
        assert!(error.to_string().contains("current leader: b"));
    }
}

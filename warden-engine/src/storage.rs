//! Encoding of raft state on top of a [`PersistenceLayer`], plus the two
//! offline operations that work on a store without a running engine.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use warden_core::messages::LogEntry;
use warden_core::persistence::{seal, unseal, PersistedState, PersistenceLayer};
use warden_core::state_machine::Snapshot;
use warden_core::{Configuration, NodeId, Result, WardenError};

use crate::log::RaftLog;

#[derive(Clone)]
pub(crate) struct RaftStorage {
    persistence: Arc<dyn PersistenceLayer>,
}

impl RaftStorage {
    pub(crate) fn new(persistence: Arc<dyn PersistenceLayer>) -> Self {
        Self { persistence }
    }

    pub(crate) async fn load(&self) -> Result<(PersistedState, Option<Snapshot>)> {
        load(self.persistence.as_ref()).await
    }

    pub(crate) async fn save_state(
        &self,
        current_term: u64,
        voted_for: Option<&NodeId>,
        entries: &[LogEntry],
    ) -> Result<()> {
        let state = PersistedState {
            current_term,
            voted_for: voted_for.cloned(),
            entries: entries.to_vec(),
        };
        self.persistence.save_state(&seal(&state)?).await
    }

    pub(crate) async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.persistence.save_snapshot(&seal(snapshot)?).await
    }
}

async fn load(persistence: &dyn PersistenceLayer) -> Result<(PersistedState, Option<Snapshot>)> {
    let state = match persistence.load_state().await? {
        Some(data) if !data.is_empty() => unseal::<PersistedState>(&data)?,
        _ => PersistedState::default(),
    };
    let snapshot = match persistence.load_snapshot().await? {
        Some(data) if !data.is_empty() => {
            let snapshot = unseal::<Snapshot>(&data)?;
            if !snapshot.verify_checksum() {
                return Err(WardenError::StateCorruption {
                    details: format!("snapshot at index {} failed verification", snapshot.last_index),
                });
            }
            Some(snapshot)
        }
        _ => None,
    };
    Ok((state, snapshot))
}

fn validate(configuration: &Configuration) -> Result<()> {
    if configuration.voter_count() == 0 {
        return Err(WardenError::consensus("configuration has no voters"));
    }
    let mut ids = HashSet::new();
    let mut addresses = HashSet::new();
    for member in &configuration.members {
        if member.id.is_empty() || member.address.is_empty() {
            return Err(WardenError::consensus(format!(
                "member {:?} has an empty id or address",
                member
            )));
        }
        if !ids.insert(&member.id) {
            return Err(WardenError::consensus(format!("duplicate member id {}", member.id)));
        }
        if !addresses.insert(&member.address) {
            return Err(WardenError::consensus(format!(
                "duplicate member address {}",
                member.address
            )));
        }
    }
    Ok(())
}

/// Writes `configuration` as the founding log entry of a new cluster.
///
/// Fails with [`WardenError::CantBootstrap`] if the store already holds
/// state. Every founder must be given the same configuration; nothing here
/// can detect founders that disagree.
pub async fn bootstrap_cluster(
    persistence: &dyn PersistenceLayer,
    configuration: &Configuration,
) -> Result<()> {
    if persistence.has_existing_state().await? {
        return Err(WardenError::CantBootstrap {
            details: "store already contains raft state".to_string(),
        });
    }
    validate(configuration)?;

    let state = PersistedState {
        current_term: 1,
        voted_for: None,
        entries: vec![LogEntry::configuration(1, 1, configuration.clone())],
    };
    persistence.save_state(&seal(&state)?).await?;
    info!(members = configuration.len(), "bootstrapped cluster configuration");
    Ok(())
}

/// Reads the latest configuration out of an existing store without
/// starting an engine. Returns `None` for an empty store.
pub async fn recover_configuration(
    persistence: &dyn PersistenceLayer,
) -> Result<Option<Configuration>> {
    if !persistence.has_existing_state().await? {
        return Ok(None);
    }
    let (state, snapshot) = load(persistence).await?;
    let log = RaftLog::restore(snapshot.as_ref(), state.entries)?;
    Ok(Some(log.latest_configuration().clone()))
}

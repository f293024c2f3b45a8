use crate::messages::LogEntry;
use crate::{NodeId, Result, WardenError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Durable raft state: the vote, the term and the log after the last
/// snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
}

/// JSON envelope carrying a crc32 over the serialized body.
#[derive(Serialize, Deserialize)]
struct Sealed<T> {
    checksum: u32,
    body: T,
}

/// Serializes `value` into a checksummed JSON document.
pub fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let sealed = Sealed {
        checksum: crc32fast::hash(&body),
        body: value,
    };
    Ok(serde_json::to_vec_pretty(&sealed)?)
}

/// Reverses [`seal`], failing with `ChecksumMismatch` when the body was
/// altered.
pub fn unseal<T: Serialize + DeserializeOwned>(data: &[u8]) -> Result<T> {
    let sealed: Sealed<T> = serde_json::from_slice(data).map_err(|e| WardenError::StateCorruption {
        details: format!("unreadable state document: {}", e),
    })?;
    let actual = crc32fast::hash(&serde_json::to_vec(&sealed.body)?);
    if actual != sealed.checksum {
        return Err(WardenError::ChecksumMismatch {
            expected: sealed.checksum,
            actual,
        });
    }
    Ok(sealed.body)
}

/// Durable store for one consensus engine.
///
/// Two documents are kept: the raft state (term, vote, log tail) and the
/// latest snapshot. Either one existing marks the store as previously
/// bootstrapped.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Save the raft state document, replacing the previous one.
    async fn save_state(&self, state: &[u8]) -> Result<()>;

    /// Load the raft state document.
    ///
    /// # Returns
    /// * `Ok(None)` if nothing was saved yet
    async fn load_state(&self) -> Result<Option<Vec<u8>>>;

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()>;

    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>>;

    /// True when this store holds state from an earlier run.
    async fn has_existing_state(&self) -> Result<bool> {
        let state = self.load_state().await?;
        if state.map(|s| !s.is_empty()).unwrap_or(false) {
            return Ok(true);
        }
        let snapshot = self.load_snapshot().await?;
        Ok(snapshot.map(|s| !s.is_empty()).unwrap_or(false))
    }
}

use crate::messages::LogEntry;
use crate::{Configuration, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Compacted prefix of the log: the configuration in effect at
/// `last_index` plus the state machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub configuration: Configuration,
    pub data: Bytes,
    pub checksum: u32,
}

impl Snapshot {
    pub fn new(
        last_index: u64,
        last_term: u64,
        configuration: Configuration,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let checksum = crc32fast::hash(&data);
        Self {
            last_index,
            last_term,
            configuration,
            data,
            checksum,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

/// Application hook invoked for every committed log entry.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&mut self, entry: &LogEntry) -> Result<()>;

    async fn snapshot(&self) -> Result<Bytes>;

    async fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// State machine that replicates nothing.
///
/// The log carries only leadership and membership agreement, so applying an
/// entry records its index and nothing else.
#[derive(Debug, Default)]
pub struct NoopStateMachine {
    last_applied: u64,
}

impl NoopStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }
}

#[async_trait]
impl StateMachine for NoopStateMachine {
    async fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        self.last_applied = entry.index;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn restore(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use warden_core::{persistence::PersistenceLayer, Result};

/// In-memory store.
///
/// Clones share the same documents, so a test can stop an engine and start
/// a new one against the "same disk".
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<RwLock<Option<Vec<u8>>>>,
    snapshot: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceLayer for InMemoryPersistence {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        *self.state.write() = Some(state.to_vec());
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().clone())
    }

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        *self.snapshot.write() = Some(snapshot.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.read().clone())
    }
}

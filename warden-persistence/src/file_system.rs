use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use warden_core::{persistence::PersistenceLayer, Result, WardenError};

const STATE_FILE: &str = "raft-log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// File-based store rooted in one directory per node.
///
/// The raft state and the snapshot live in separate files, each replaced
/// atomically on every save.
#[derive(Debug, Clone)]
pub struct FileSystemPersistence {
    data_dir: PathBuf,
    state_file_path: PathBuf,
    snapshot_file_path: PathBuf,
}

impl FileSystemPersistence {
    /// Create a store in `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    /// * Returns error if the data directory cannot be created
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await.map_err(|e| {
                WardenError::persistence(format!(
                    "Failed to create data directory {}: {}",
                    data_dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            state_file_path: data_dir.join(STATE_FILE),
            snapshot_file_path: data_dir.join(SNAPSHOT_FILE),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        // Write to a temporary file first, then atomically move to final location
        let temp_file_path = path.with_extension("tmp");

        fs::write(&temp_file_path, data).await.map_err(|e| {
            WardenError::persistence(format!(
                "Failed to write {}: {}",
                temp_file_path.display(),
                e
            ))
        })?;

        fs::rename(&temp_file_path, path).await.map_err(|e| {
            WardenError::persistence(format!(
                "Failed to rename temp file to {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(path = %path.display(), bytes = data.len(), "persisted document");
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WardenError::persistence(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl PersistenceLayer for FileSystemPersistence {
    async fn save_state(&self, state: &[u8]) -> Result<()> {
        Self::write_atomic(&self.state_file_path, state).await
    }

    async fn load_state(&self) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.state_file_path).await
    }

    async fn save_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        Self::write_atomic(&self.snapshot_file_path, snapshot).await
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.snapshot_file_path).await
    }
}

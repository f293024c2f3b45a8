#[cfg(test)]
mod unit_tests {
    use crate::{FileSystemPersistence, InMemoryPersistence};
    use tempfile::TempDir;
    use warden_core::persistence::PersistenceLayer;

    #[tokio::test]
    async fn test_in_memory_persistence() {
        let persistence = InMemoryPersistence::new();

        assert!(persistence.load_state().await.unwrap().is_none());
        assert!(persistence.load_snapshot().await.unwrap().is_none());

        persistence.save_state(b"state").await.unwrap();
        persistence.save_snapshot(b"snapshot").await.unwrap();

        // Clones share storage
        let other = persistence.clone();
        assert_eq!(other.load_state().await.unwrap(), Some(b"state".to_vec()));
        assert_eq!(
            other.load_snapshot().await.unwrap(),
            Some(b"snapshot".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_system_persistence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = FileSystemPersistence::new(temp_dir.path()).await.unwrap();

        assert!(!persistence.has_existing_state().await.unwrap());

        persistence.save_state(b"term 3").await.unwrap();
        persistence.save_snapshot(b"image").await.unwrap();

        let reopened = FileSystemPersistence::new(temp_dir.path()).await.unwrap();
        assert!(reopened.has_existing_state().await.unwrap());
        assert_eq!(reopened.load_state().await.unwrap(), Some(b"term 3".to_vec()));
        assert_eq!(reopened.load_snapshot().await.unwrap(), Some(b"image".to_vec()));

        // No temp files are left behind
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_alone_marks_existing_state() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = FileSystemPersistence::new(temp_dir.path()).await.unwrap();

        persistence.save_snapshot(b"image").await.unwrap();
        assert!(persistence.has_existing_state().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_documents_are_not_existing_state() {
        let persistence = InMemoryPersistence::new();
        persistence.save_state(b"").await.unwrap();
        assert!(!persistence.has_existing_state().await.unwrap());
    }

    #[tokio::test]
    async fn test_creates_nested_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let persistence = FileSystemPersistence::new(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert_eq!(persistence.data_dir(), nested.as_path());
    }
}

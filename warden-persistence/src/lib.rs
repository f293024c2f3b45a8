//! # Warden Persistence
//!
//! Durable stores for the consensus engine.
//!
//! ## Implementations
//!
//! - [`InMemoryPersistence`] - documents held in memory (testing)
//! - [`FileSystemPersistence`] - one directory per node holding
//!   `raft-log.json` and `snapshot.json`
//!
//! ## Example
//!
//! ```rust
//! use warden_persistence::InMemoryPersistence;
//! use warden_core::persistence::PersistenceLayer;
//!
//! # tokio_test::block_on(async {
//! let persistence = InMemoryPersistence::new();
//! assert!(!persistence.has_existing_state().await.unwrap());
//! persistence.save_state(b"{}").await.unwrap();
//! assert!(persistence.has_existing_state().await.unwrap());
//! # });
//! ```

pub mod file_system;
pub mod in_memory;
mod tests;

pub use file_system::FileSystemPersistence;
pub use in_memory::InMemoryPersistence;

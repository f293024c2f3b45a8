//! # Warden Engine
//!
//! Raft consensus used by Warden to agree on a leader and on cluster
//! membership. The replicated log carries only configuration entries and
//! the blank entry each new leader appends.
//!
//! ## Key Components
//!
//! - **RaftNode**: the engine task that owns all consensus state
//! - **RaftHandle**: cloneable handle for status reads, membership changes,
//!   leadership notifications and observers
//! - **RaftConfig**: timing and sizing knobs
//! - **bootstrap_cluster / recover_configuration**: offline operations on a
//!   store that has no running engine
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_core::{network::TransportFactory, state_machine::NoopStateMachine};
//! use warden_core::{ClusterMember, Configuration, NodeId};
//! use warden_engine::{bootstrap_cluster, RaftConfig, RaftNode};
//! use warden_persistence::InMemoryPersistence;
//!
//! async fn run(factory: Arc<dyn TransportFactory>) -> warden_core::Result<()> {
//!     let id = NodeId::new("a");
//!     let persistence = Arc::new(InMemoryPersistence::new());
//!     let founders = Configuration::new(vec![ClusterMember::voter("a", "127.0.0.1:7300")]);
//!     bootstrap_cluster(persistence.as_ref(), &founders).await?;
//!
//!     let (transport, inbound) = factory.bind(&id, "127.0.0.1:7300").await?;
//!     let handle = RaftNode::start(
//!         id,
//!         RaftConfig::default(),
//!         transport,
//!         inbound,
//!         persistence,
//!         Box::new(NoopStateMachine::new()),
//!     )
//!     .await?;
//!
//!     let mut leadership = handle.leadership();
//!     leadership.changed().await.ok();
//!     handle.shutdown().await
//! }
//! ```

pub mod config;
pub mod engine;
pub mod handle;
pub mod log;
pub mod observer;
mod storage;

pub use config::RaftConfig;
pub use engine::RaftNode;
pub use handle::{EngineStatus, MembershipChange, RaftHandle};
pub use log::RaftLog;
pub use observer::{ObserverId, ObserverRegistry, ObserverStats};
pub use storage::{bootstrap_cluster, recover_configuration};

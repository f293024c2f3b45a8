use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use warden_core::{Configuration, NodeId, Observation, ObservationFilter, RaftRole, Result, WardenError};

use crate::observer::{ObserverId, ObserverRegistry, ObserverStats};

/// Single-server membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddVoter { id: NodeId, address: String },
    AddNonvoter { id: NodeId, address: String },
    RemoveServer { id: NodeId },
}

pub(crate) enum EngineCommand {
    ChangeMembership {
        change: MembershipChange,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Snapshot of engine state, republished after every event the engine
/// handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub id: NodeId,
    pub address: String,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    /// Latest configuration, including an uncommitted change.
    pub configuration: Configuration,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

impl EngineStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

struct HandleInner {
    id: NodeId,
    commands: mpsc::Sender<EngineCommand>,
    status: watch::Receiver<EngineStatus>,
    leadership: watch::Receiver<bool>,
    observers: Arc<ObserverRegistry>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Cloneable handle to a running [`crate::RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    inner: Arc<HandleInner>,
}

impl RaftHandle {
    pub(crate) fn new(
        id: NodeId,
        commands: mpsc::Sender<EngineCommand>,
        status: watch::Receiver<EngineStatus>,
        leadership: watch::Receiver<bool>,
        observers: Arc<ObserverRegistry>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                commands,
                status,
                leadership,
                observers,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Reads the most recently published status. Never blocks on the
    /// engine and never observes a half-applied change.
    pub fn status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status.borrow().is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.status.borrow().leader.clone()
    }

    pub fn configuration(&self) -> Configuration {
        self.inner.status.borrow().configuration.clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.clone()
    }

    /// Leadership notifications: `true` on becoming leader, `false` on
    /// losing it. Intermediate values may be skipped; the latest one is
    /// always observed.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.inner.leadership.clone()
    }

    pub fn register_observer(
        &self,
        filter: ObservationFilter,
        sink: mpsc::Sender<Observation>,
    ) -> ObserverId {
        self.inner.observers.register(filter, sink)
    }

    pub fn deregister_observer(&self, id: &ObserverId) -> bool {
        self.inner.observers.deregister(id)
    }

    pub fn observer_stats(&self) -> ObserverStats {
        self.inner.observers.stats()
    }

    pub async fn add_voter(&self, id: NodeId, address: String) -> Result<()> {
        self.change_membership(MembershipChange::AddVoter { id, address })
            .await
    }

    pub async fn add_nonvoter(&self, id: NodeId, address: String) -> Result<()> {
        self.change_membership(MembershipChange::AddNonvoter { id, address })
            .await
    }

    /// Removing a server that is not a member succeeds without writing a
    /// log entry.
    pub async fn remove_server(&self, id: NodeId) -> Result<()> {
        self.change_membership(MembershipChange::RemoveServer { id })
            .await
    }

    /// Submits `change` and waits until it commits.
    pub async fn change_membership(&self, change: MembershipChange) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(EngineCommand::ChangeMembership { change, reply })
            .await
            .map_err(|_| WardenError::Shutdown)?;
        rx.await.map_err(|_| WardenError::Shutdown)?
    }

    /// Stops the engine and waits for its task to finish. Later calls
    /// return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| WardenError::internal(format!("engine task failed: {}", e)))??;
        }
        Ok(())
    }
}

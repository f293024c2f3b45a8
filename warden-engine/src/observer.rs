//! Filtered, non-blocking taps on the engine's observation stream.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;
use warden_core::{Observation, ObservationFilter};

/// Unique identifier for a registered observer
pub type ObserverId = Uuid;

/// Statistics about observation delivery
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObserverStats {
    pub delivered: u64,
    /// Dropped because the observer's channel was full.
    pub dropped: u64,
    /// Rejected by the observer's filter.
    pub filtered: u64,
    pub active_observers: usize,
}

struct Observer {
    filter: ObservationFilter,
    sink: mpsc::Sender<Observation>,
}

/// Registry of observers attached to one engine.
///
/// The filter runs on the producer side, so rejected observations never use
/// the observer's channel capacity. Delivery uses `try_send`: a full channel
/// loses the observation rather than stalling the engine.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: DashMap<ObserverId, Observer>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filter: ObservationFilter, sink: mpsc::Sender<Observation>) -> ObserverId {
        let id = Uuid::new_v4();
        debug!(observer = %id, ?filter, "registered observer");
        self.observers.insert(id, Observer { filter, sink });
        id
    }

    pub fn deregister(&self, id: &ObserverId) -> bool {
        self.observers.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, observation: &Observation) {
        let mut closed = Vec::new();

        for entry in self.observers.iter() {
            let observer = entry.value();
            if !observer.filter.matches(observation) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match observer.sink.try_send(observation.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(observer = %entry.key(), "observer channel full, dropping observation");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            debug!(observer = %id, "observer channel closed, deregistering");
            self.observers.remove(&id);
        }
    }

    pub fn stats(&self) -> ObserverStats {
        ObserverStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            active_observers: self.observers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{NodeId, ObservationKind};

    fn failed(peer: &str) -> Observation {
        Observation::FailedHeartbeat {
            peer: NodeId::new(peer),
            failures: 1,
        }
    }

    #[tokio::test]
    async fn test_filter_runs_before_queueing() {
        let registry = ObserverRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(ObservationFilter::Kind(ObservationKind::Leadership), tx);

        // Rejected observations must not take the single slot
        registry.notify(&failed("b"));
        registry.notify(&Observation::LeaderChange {
            leader: Some(NodeId::new("a")),
            term: 1,
        });

        assert!(matches!(rx.recv().await, Some(Observation::LeaderChange { .. })));
        let stats = registry.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let registry = ObserverRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(ObservationFilter::All, tx);

        registry.notify(&failed("b"));
        registry.notify(&failed("c"));

        assert_eq!(registry.stats().dropped, 1);
        assert_eq!(rx.recv().await, Some(failed("b")));
    }

    #[tokio::test]
    async fn test_closed_observer_is_removed() {
        let registry = ObserverRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        let id = registry.register(ObservationFilter::All, tx);
        drop(rx);

        registry.notify(&failed("b"));
        assert!(registry.is_empty());
        assert!(!registry.deregister(&id));
    }
}

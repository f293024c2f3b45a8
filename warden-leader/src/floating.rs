//! Keeps the floating address on this node exactly while it is leader.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_core::configurator::NetworkConfigurator;

/// Default period between drift checks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// What the loop last decided the resource should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Released,
    Asserted,
}

/// Single writer of the floating address.
///
/// Driven by leadership notifications and a periodic tick. Configurator
/// failures are logged and retried on the next event; they never end the
/// loop.
pub struct ReconciliationLoop {
    leadership: watch::Receiver<bool>,
    configurator: Arc<dyn NetworkConfigurator>,
    interval: Duration,
    state: ResourceState,
    /// A release failed and is retried on each tick while released.
    release_pending: bool,
    state_tx: watch::Sender<ResourceState>,
}

impl ReconciliationLoop {
    pub fn new(
        leadership: watch::Receiver<bool>,
        configurator: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ResourceState::Released);
        Self {
            leadership,
            configurator,
            interval: DEFAULT_RECONCILE_INTERVAL,
            state: ResourceState::Released,
            release_pending: false,
            state_tx,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Starts the loop on its own task.
    pub fn spawn(self) -> FloatingHandle {
        let cancel = CancellationToken::new();
        let state = self.state_tx.subscribe();
        let task = tokio::spawn(self.run(cancel.clone()));
        FloatingHandle {
            cancel,
            state,
            task,
        }
    }

    fn set_state(&mut self, state: ResourceState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "floating resource state change");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn assert_resource(&mut self) {
        info!("leadership acquired, asserting floating address");
        self.release_pending = false;
        if let Err(e) = self.configurator.add_ip().await {
            error!(error = %e, "failed to assert floating address");
        }
        // Asserted even on failure, so the next tick retries the add
        self.set_state(ResourceState::Asserted);
    }

    async fn release_resource(&mut self) {
        match self.configurator.delete_ip().await {
            Ok(()) => self.release_pending = false,
            Err(e) => {
                error!(error = %e, "failed to release floating address");
                self.release_pending = true;
            }
        }
        self.set_state(ResourceState::Released);
    }

    async fn check_drift(&mut self) {
        if self.state == ResourceState::Released {
            if self.release_pending {
                debug!("retrying release of floating address");
                self.release_resource().await;
            }
            return;
        }
        match self.configurator.is_set().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("floating address missing while leader, re-asserting");
                if let Err(e) = self.configurator.add_ip().await {
                    error!(error = %e, "failed to re-assert floating address");
                }
            }
            Err(e) => warn!(error = %e, "failed to check floating address"),
        }
    }

    async fn on_leadership(&mut self, leader: bool) {
        match (leader, self.state) {
            (true, ResourceState::Released) => self.assert_resource().await,
            (false, ResourceState::Asserted) => {
                info!("leadership lost, releasing floating address");
                self.release_resource().await
            }
            // Repeated value; the tick covers drift
            _ => {}
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        // A crash may have left the address behind
        self.release_resource().await;

        let leader = *self.leadership.borrow_and_update();
        self.on_leadership(leader).await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                changed = self.leadership.changed() => {
                    if changed.is_err() {
                        // The engine is gone; nothing can make us leader again
                        if self.state == ResourceState::Asserted || self.release_pending {
                            self.release_resource().await;
                        }
                        cancel.cancelled().await;
                        break;
                    }
                    let leader = *self.leadership.borrow_and_update();
                    self.on_leadership(leader).await;
                }

                _ = ticker.tick() => self.check_drift().await,
            }
        }

        if self.state == ResourceState::Asserted || self.release_pending {
            info!("stopping, releasing floating address");
            self.release_resource().await;
        }
        debug!("reconciliation loop stopped");
    }
}

/// Control handle for a running [`ReconciliationLoop`].
pub struct FloatingHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ResourceState>,
    task: JoinHandle<()>,
}

impl FloatingHandle {
    pub fn state(&self) -> ResourceState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ResourceState> {
        self.state.clone()
    }

    /// Signals the loop to stop and waits until it has released the
    /// address and exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "reconciliation loop panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::configurator::InMemoryConfigurator;

    const TICK: Duration = Duration::from_millis(20);

    fn start(leader: bool) -> (watch::Sender<bool>, Arc<InMemoryConfigurator>, FloatingHandle) {
        let (tx, rx) = watch::channel(leader);
        let configurator = Arc::new(InMemoryConfigurator::new());
        let handle = ReconciliationLoop::new(rx, configurator.clone())
            .with_interval(TICK)
            .spawn();
        (tx, configurator, handle)
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_startup_releases_leftover_address() {
        let (tx, rx) = watch::channel(false);
        let configurator = Arc::new(InMemoryConfigurator::new());
        configurator.set_externally(true);

        let handle = ReconciliationLoop::new(rx, configurator.clone())
            .with_interval(TICK)
            .spawn();
        eventually(|| !configurator.is_present()).await;
        assert_eq!(handle.state(), ResourceState::Released);

        drop(tx);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_follows_leadership() {
        let (tx, configurator, handle) = start(false);

        tx.send_replace(true);
        eventually(|| configurator.is_present()).await;
        assert_eq!(handle.state(), ResourceState::Asserted);

        tx.send_replace(false);
        eventually(|| !configurator.is_present()).await;
        assert_eq!(handle.state(), ResourceState::Released);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_initial_leadership_is_honoured() {
        let (_tx, configurator, handle) = start(true);
        eventually(|| configurator.is_present()).await;
        handle.stop().await;
        assert!(!configurator.is_present());
    }

    #[tokio::test]
    async fn test_drift_is_repaired() {
        let (tx, configurator, handle) = start(false);
        tx.send_replace(true);
        eventually(|| configurator.is_present()).await;
        let adds = configurator.add_count();

        // Removed behind our back; no new notification
        configurator.set_externally(false);
        eventually(|| configurator.is_present()).await;
        assert!(configurator.add_count() > adds);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_no_repair_while_released() {
        let (_tx, configurator, handle) = start(false);
        eventually(|| handle.state() == ResourceState::Released).await;
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(configurator.add_count(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_before_completion() {
        let (tx, configurator, handle) = start(false);
        tx.send_replace(true);
        eventually(|| configurator.is_present()).await;

        handle.stop().await;
        assert!(!configurator.is_present());
    }

    #[tokio::test]
    async fn test_failures_do_not_end_the_loop() {
        let (tx, configurator, handle) = start(false);
        configurator.set_failing(true);
        tx.send_replace(true);
        eventually(|| handle.state() == ResourceState::Asserted).await;
        assert!(!configurator.is_present());

        // Once the configurator recovers, the tick re-asserts
        configurator.set_failing(false);
        eventually(|| configurator.is_present()).await;

        handle.stop().await;
        assert!(!configurator.is_present());
    }

    #[tokio::test]
    async fn test_failed_release_is_retried() {
        let (tx, configurator, handle) = start(true);
        eventually(|| configurator.is_present()).await;

        configurator.set_failing(true);
        tx.send_replace(false);
        eventually(|| handle.state() == ResourceState::Released).await;
        assert!(configurator.is_present());

        // No new notification; the tick keeps retrying the delete
        configurator.set_failing(false);
        eventually(|| !configurator.is_present()).await;
        assert_eq!(handle.state(), ResourceState::Released);

        handle.stop().await;
        assert!(!configurator.is_present());
    }
}

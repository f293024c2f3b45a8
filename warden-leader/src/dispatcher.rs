//! Fans engine observations out to plugins, one worker per plugin.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_core::{Observation, ObservationFilter};
use warden_engine::{ObserverId, ObserverRegistry};

use crate::plugin::{Plugin, PluginContext, PluginRegistry};
use crate::{LeaderError, LeaderResult};

/// Observations queued per plugin before the engine starts dropping them.
pub const PLUGIN_CHANNEL_CAPACITY: usize = 64;

/// Something that delivers filtered observations into a channel.
pub trait ObservationSource: Send + Sync {
    fn register_observer(
        &self,
        filter: ObservationFilter,
        sink: mpsc::Sender<Observation>,
    ) -> LeaderResult<ObserverId>;

    fn deregister_observer(&self, id: &ObserverId) -> bool;
}

impl ObservationSource for ObserverRegistry {
    fn register_observer(
        &self,
        filter: ObservationFilter,
        sink: mpsc::Sender<Observation>,
    ) -> LeaderResult<ObserverId> {
        Ok(self.register(filter, sink))
    }

    fn deregister_observer(&self, id: &ObserverId) -> bool {
        self.deregister(id)
    }
}

struct PluginWorker {
    name: String,
    observer: ObserverId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Running plugin workers.
pub struct ObserverDispatcher {
    source: Arc<dyn ObservationSource>,
    workers: Vec<PluginWorker>,
}

impl ObserverDispatcher {
    /// Sets up and starts every plugin in `registry`, in order.
    ///
    /// Each plugin is set up before its observer is registered. If any
    /// setup fails, the plugins already started are shut down and the
    /// error is returned.
    pub async fn start(
        registry: PluginRegistry,
        ctx: PluginContext,
        source: Arc<dyn ObservationSource>,
    ) -> LeaderResult<Self> {
        let mut dispatcher = Self {
            source,
            workers: Vec::new(),
        };

        for mut plugin in registry.into_plugins() {
            let name = plugin.name().to_string();

            if let Err(e) = plugin.setup(&ctx).await {
                error!(plugin = %name, error = %e, "plugin setup failed");
                dispatcher.shutdown().await;
                return Err(LeaderError::PluginSetup {
                    name,
                    reason: e.to_string(),
                });
            }

            let (sink, observations) = mpsc::channel(PLUGIN_CHANNEL_CAPACITY);
            let observer = match dispatcher.source.register_observer(plugin.filter(), sink) {
                Ok(observer) => observer,
                Err(e) => {
                    if let Err(e) = plugin.shutdown().await {
                        warn!(plugin = %name, error = %e, "plugin failed to shutdown");
                    }
                    dispatcher.shutdown().await;
                    return Err(e);
                }
            };

            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_worker(name.clone(), plugin, observations, cancel.clone()));
            info!(plugin = %name, "plugin started");

            dispatcher.workers.push(PluginWorker {
                name,
                observer,
                cancel,
                task,
            });
        }

        Ok(dispatcher)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Cancels every worker and waits for their shutdown hooks.
    pub async fn shutdown(&mut self) {
        let workers: Vec<PluginWorker> = self.workers.drain(..).collect();
        for worker in &workers {
            worker.cancel.cancel();
            self.source.deregister_observer(&worker.observer);
        }
        for worker in workers {
            if let Err(e) = worker.task.await {
                error!(plugin = %worker.name, error = %e, "plugin worker panicked");
            }
        }
    }
}

async fn run_worker(
    name: String,
    mut plugin: Box<dyn Plugin>,
    mut observations: mpsc::Receiver<Observation>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            observation = observations.recv() => match observation {
                Some(observation) => {
                    if let Err(e) = plugin.handle(&observation).await {
                        warn!(plugin = %name, error = %e, "plugin failed to run");
                    }
                }
                None => {
                    debug!(plugin = %name, "observation source closed");
                    break;
                }
            }
        }
    }

    if let Err(e) = plugin.shutdown().await {
        warn!(plugin = %name, error = %e, "plugin failed to shutdown");
    }
    info!(plugin = %name, "plugin stopped");
}

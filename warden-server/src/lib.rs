//! # Warden Server
//!
//! Runs one Warden node: the consensus manager, the configured plugins,
//! the floating address loop and the management API.
//!
//! ```rust,no_run
//! use warden_server::{config::load_config, Warden};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config("warden.json")?;
//! let mut warden = Warden::new(config)?;
//! warden.start().await?;
//! // ... wait for a signal ...
//! warden.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_leader::{
    plugins, ConsensusManager, FloatingHandle, LeaderError, LeaderResult, ObserverDispatcher,
    PluginContext, PluginRegistry, ReconciliationLoop,
};
use warden_network::{AliasConfigurator, TcpTransportFactory};

use crate::config::WardenConfig;

/// Grace period for in-flight API requests on stop.
pub const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

struct HttpServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A running (or startable) Warden node.
pub struct Warden {
    config: WardenConfig,
    manager: Arc<ConsensusManager>,
    dispatcher: Option<ObserverDispatcher>,
    floating: Option<FloatingHandle>,
    http: Option<HttpServer>,
}

impl Warden {
    /// Builds the consensus manager. Nothing is started yet.
    pub fn new(config: WardenConfig) -> LeaderResult<Self> {
        let manager = ConsensusManager::new(
            config.id.clone(),
            config.raft_config(),
            Arc::new(TcpTransportFactory::default()),
        )?;
        Ok(Self::with_manager(config, manager))
    }

    /// Uses an already constructed manager, for instance one built over
    /// an in-memory transport.
    pub fn with_manager(config: WardenConfig, manager: ConsensusManager) -> Self {
        Self {
            config,
            manager: Arc::new(manager),
            dispatcher: None,
            floating: None,
            http: None,
        }
    }

    pub fn manager(&self) -> &Arc<ConsensusManager> {
        &self.manager
    }

    /// Address the management API is bound to, once started.
    pub fn api_address(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|h| h.local_addr)
    }

    /// Starts the engine, then plugins, the floating loop and the API.
    ///
    /// On failure everything started so far is stopped again.
    pub async fn start(&mut self) -> LeaderResult<()> {
        if let Err(e) = self.start_components().await {
            error!(node_id = %self.config.id, error = %e, "failed to start warden");
            self.stop().await;
            return Err(e);
        }
        info!(node_id = %self.config.id, "warden started");
        Ok(())
    }

    async fn start_components(&mut self) -> LeaderResult<()> {
        self.manager
            .init_or_join(&self.config.initial_cluster, &self.config.store)
            .await?;

        let registry = PluginRegistry::new(plugins::builtin(&self.config.plugins[..])?)?;
        let ctx = PluginContext {
            node_id: self.config.id.clone(),
            store_path: self.config.store.clone(),
            raw_config: self.config.raw.clone(),
            cluster: self.manager.clone(),
        };
        self.dispatcher =
            Some(ObserverDispatcher::start(registry, ctx, self.manager.clone()).await?);

        if let Some(floating) = &self.config.floating {
            let configurator = AliasConfigurator::new(&floating.address, &floating.iface).await?;
            let handle = ReconciliationLoop::new(
                self.manager.leadership_notifications()?,
                Arc::new(configurator),
            )
            .with_interval(self.config.reconcile_interval())
            .spawn();
            info!(
                node_id = %self.config.id,
                iface = %floating.iface,
                address = %floating.address,
                "floating address loop started"
            );
            self.floating = Some(handle);
        }

        self.http = Some(self.serve().await?);
        Ok(())
    }

    async fn serve(&self) -> LeaderResult<HttpServer> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| LeaderError::config(format!("cannot listen on {}: {}", self.config.listen, e)))?;
        let local_addr = listener.local_addr().map_err(|e| LeaderError::Internal {
            reason: e.to_string(),
        })?;

        let app = api::router(self.manager.clone());
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!(error = %e, "management API failed");
            }
        });
        info!(address = %local_addr, "management API listening");

        Ok(HttpServer {
            local_addr,
            cancel,
            task,
        })
    }

    /// Stops the API, the plugins, the floating loop and finally the
    /// engine. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(http) = self.http.take() {
            http.cancel.cancel();
            let abort = http.task.abort_handle();
            if tokio::time::timeout(HTTP_SHUTDOWN_GRACE, http.task).await.is_err() {
                warn!("management API did not drain in time");
                abort.abort();
            }
        }

        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }

        if let Some(floating) = self.floating.take() {
            floating.stop().await;
        }

        self.manager.shutdown().await;
        info!(node_id = %self.config.id, "warden stopped");
    }
}

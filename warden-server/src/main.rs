//! warden: holds a floating address on the leader of a Raft cluster.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::{fmt, prelude::*};

use warden_server::config::{load_config, RaftLogConfig};
use warden_server::Warden;

/// Engine records are emitted under this target.
const ENGINE_TARGET: &str = "warden_engine";

/// Command-line arguments for a Warden node.
#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Raft-backed floating IP failover"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "warden.json")]
    config: String,

    /// Override the management API address (host:port).
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "warden failed");
            eprintln!("warden: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(&RaftLogConfig::default())?;
            return Err(e).with_context(|| format!("loading configuration from {}", cli.config));
        }
    };
    init_logging(&config.raft_log)?;
    info!(path = %cli.config, node_id = %config.id, "configuration loaded");

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let mut warden = Warden::new(config).context("creating consensus manager")?;
    warden.start().await.context("starting warden")?;

    shutdown_signal().await;
    warden.stop().await;
    Ok(())
}

/// JSON records to stdout filtered by `RUST_LOG` (default `info`). Engine
/// records go to the raft log file when it is enabled, and are kept at
/// `warn` and above on stdout otherwise.
fn init_logging(raft_log: &RaftLogConfig) -> anyhow::Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if raft_log.enable {
        let level: LevelFilter = raft_log
            .level
            .parse()
            .with_context(|| format!("invalid raft_log level '{}'", raft_log.level))?;
        if let Some(parent) = raft_log.output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&raft_log.output)
            .with_context(|| format!("opening {}", raft_log.output.display()))?;

        let main = fmt::layer()
            .json()
            .with_filter(env.add_directive(format!("{}=off", ENGINE_TARGET).parse()?));
        let engine = fmt::layer()
            .json()
            .with_writer(Arc::new(file))
            .with_filter(Targets::new().with_target(ENGINE_TARGET, level));
        tracing_subscriber::registry()
            .with(main)
            .with(engine)
            .try_init()?;
    } else {
        let main = fmt::layer()
            .json()
            .with_filter(env.add_directive(format!("{}=warn", ENGINE_TARGET).parse()?));
        tracing_subscriber::registry().with(main).try_init()?;
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

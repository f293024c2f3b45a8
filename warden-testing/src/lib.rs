//! # Warden Testing
//!
//! Test support for Warden clusters:
//!
//! - [`NetworkSimulator`]: an in-memory transport factory with partitions,
//!   node isolation, latency and loss
//! - [`ClusterHarness`]: founders over one simulator with fast engine
//!   timings, plus polling helpers such as [`eventually`]

pub mod harness;
pub mod network_sim;

pub use harness::{eventually, ClusterHarness, DEFAULT_WAIT};
pub use network_sim::{NetworkConditions, NetworkSimulator, NetworkStats, SimulatedTransport};

/// Installs a test subscriber once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

use std::time::Duration;

/// Timing and sizing knobs for a [`crate::RaftNode`].
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// How often the leader contacts an idle follower.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout. The actual timeout
    /// is drawn from `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,
    /// A leader that has not heard from a quorum within this window steps
    /// down.
    pub leader_lease_timeout: Duration,
    /// Deadline for a single outbound RPC.
    pub rpc_timeout: Duration,
    /// Resolution of the engine's timer.
    pub tick_interval: Duration,
    pub max_append_entries: usize,
    /// Applied entries past the last snapshot before the log is compacted.
    pub snapshot_threshold: u64,
    pub command_buffer: usize,
    pub randomization_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout: Duration::from_millis(1000),
            leader_lease_timeout: Duration::from_millis(750),
            rpc_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(50),
            max_append_entries: 64,
            snapshot_threshold: 128,
            command_buffer: 64,
            randomization_seed: None,
        }
    }
}

impl RaftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timings suited to in-process clusters in tests.
    pub fn fast() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30),
            election_timeout: Duration::from_millis(200),
            leader_lease_timeout: Duration::from_millis(150),
            rpc_timeout: Duration::from_millis(100),
            tick_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_leader_lease_timeout(mut self, timeout: Duration) -> Self {
        self.leader_lease_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_randomization_seed(mut self, seed: u64) -> Self {
        self.randomization_seed = Some(seed);
        self
    }
}

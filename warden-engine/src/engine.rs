use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use warden_core::{
    messages::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, LogEntry, RequestVoteRequest, RequestVoteResponse, RpcRequest,
        RpcResponse,
    },
    network::{InboundReceiver, InboundRpc, RaftTransport},
    persistence::PersistenceLayer,
    state_machine::{Snapshot, StateMachine},
    ClusterMember, Configuration, NodeId, Observation, RaftRole, Result, WardenError,
};

use crate::handle::{EngineCommand, EngineStatus, MembershipChange, RaftHandle};
use crate::log::RaftLog;
use crate::observer::ObserverRegistry;
use crate::storage::RaftStorage;
use crate::RaftConfig;

/// Leader-side replication state for one peer.
#[derive(Debug)]
struct PeerProgress {
    address: String,
    next_index: u64,
    match_index: u64,
    inflight: bool,
    last_sent: Instant,
    last_contact: Instant,
    failing: bool,
    failures: u64,
}

impl PeerProgress {
    fn new(address: String, next_index: u64, now: Instant, heartbeat: Duration) -> Self {
        Self {
            address,
            next_index,
            match_index: 0,
            inflight: false,
            last_sent: now.checked_sub(heartbeat).unwrap_or(now),
            last_contact: now,
            failing: false,
            failures: 0,
        }
    }
}

struct PendingChange {
    index: u64,
    reply: oneshot::Sender<Result<()>>,
}

/// Results of RPCs issued from spawned tasks, fed back into the event loop.
enum RpcOutcome {
    Vote {
        peer: NodeId,
        term: u64,
        result: Result<RequestVoteResponse>,
    },
    Append {
        peer: NodeId,
        term: u64,
        last_sent: u64,
        result: Result<AppendEntriesResponse>,
    },
    Snapshot {
        peer: NodeId,
        term: u64,
        last_index: u64,
        result: Result<InstallSnapshotResponse>,
    },
}

/// A raft participant.
///
/// The node is a single task that owns all consensus state. Inbound RPCs,
/// results of outbound RPCs, membership commands and timer ticks are all
/// handled sequentially by [`RaftNode::run`]; callers interact through a
/// [`RaftHandle`].
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    inbound: InboundReceiver,
    commands: mpsc::Receiver<EngineCommand>,
    outcomes_tx: mpsc::UnboundedSender<RpcOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<RpcOutcome>,
    storage: RaftStorage,
    state_machine: Box<dyn StateMachine>,
    log: RaftLog,
    snapshot: Option<Snapshot>,
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
    votes: HashSet<NodeId>,
    peers: HashMap<NodeId, PeerProgress>,
    pending_change: Option<PendingChange>,
    observers: Arc<ObserverRegistry>,
    leadership_tx: watch::Sender<bool>,
    status_tx: watch::Sender<EngineStatus>,
    shutdown_rx: watch::Receiver<bool>,
    rng: StdRng,
}

impl RaftNode {
    /// Restores state from `persistence` and spawns the engine task.
    ///
    /// The store must have been bootstrapped (see
    /// [`crate::bootstrap_cluster`]) or hold state from an earlier run;
    /// an empty store yields a node with no configuration that never
    /// campaigns.
    pub async fn start(
        id: NodeId,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        inbound: InboundReceiver,
        persistence: Arc<dyn PersistenceLayer>,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<RaftHandle> {
        let storage = RaftStorage::new(persistence);
        let (state, snapshot) = storage.load().await?;
        let log = RaftLog::restore(snapshot.as_ref(), state.entries)?;

        if let Some(snapshot) = &snapshot {
            state_machine.restore(&snapshot.data).await?;
        }

        let rng = match config.randomization_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (command_tx, commands) = mpsc::channel(config.command_buffer);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (leadership_tx, leadership_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let observers = Arc::new(ObserverRegistry::new());

        let commit_index = log.snapshot_index();
        let initial_status = EngineStatus {
            id: id.clone(),
            address: transport.local_address().to_string(),
            role: RaftRole::Follower,
            term: state.current_term,
            leader: None,
            configuration: log.latest_configuration().clone(),
            commit_index,
            last_applied: commit_index,
            last_log_index: log.last_index(),
        };
        let (status_tx, status_rx) = watch::channel(initial_status);

        let mut node = Self {
            id: id.clone(),
            config,
            transport,
            inbound,
            commands,
            outcomes_tx,
            outcomes_rx,
            storage,
            state_machine,
            log,
            snapshot,
            role: RaftRole::Follower,
            current_term: state.current_term,
            voted_for: state.voted_for,
            leader: None,
            commit_index,
            last_applied: commit_index,
            election_deadline: Instant::now(),
            last_leader_contact: None,
            votes: HashSet::new(),
            peers: HashMap::new(),
            pending_change: None,
            observers: observers.clone(),
            leadership_tx,
            status_tx,
            shutdown_rx,
            rng,
        };
        node.reset_election_deadline();

        let task = tokio::spawn(node.run());

        Ok(RaftHandle::new(
            id,
            command_tx,
            status_rx,
            leadership_rx,
            observers,
            shutdown_tx,
            task,
        ))
    }

    async fn run(mut self) -> Result<()> {
        info!(
            node_id = %self.id,
            address = %self.transport.local_address(),
            term = self.current_term,
            last_index = self.log.last_index(),
            members = self.log.latest_configuration().len(),
            "starting raft engine"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(rpc) = self.inbound.recv() => {
                    self.handle_inbound(rpc).await;
                }

                Some(outcome) = self.outcomes_rx.recv() => {
                    if let Err(e) = self.handle_outcome(outcome).await {
                        error!(node_id = %self.id, error = %e, "failed to handle rpc result");
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(node_id = %self.id, error = %e, "raft tick failed");
                    }
                }
            }

            self.publish_status();
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        info!(node_id = %self.id, term = self.current_term, "stopping raft engine");
        self.set_leader(None);
        self.set_role(RaftRole::Shutdown);
        self.transport.shutdown().await;
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = EngineStatus {
            id: self.id.clone(),
            address: self.transport.local_address().to_string(),
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
            configuration: self.log.latest_configuration().clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    // ---- state transitions ----

    fn reset_election_deadline(&mut self) {
        let base = self.config.election_timeout.as_millis().max(1) as u64;
        let jitter = self.rng.gen_range(base..base * 2);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }

    /// Updates the role. Subscribers are told only after the status view
    /// reflects it.
    fn set_role(&mut self, role: RaftRole) {
        if self.role == role {
            return;
        }
        let was_leader = self.role == RaftRole::Leader;
        debug!(node_id = %self.id, from = %self.role, to = %role, term = self.current_term, "role change");
        self.role = role;
        self.publish_status();
        self.observers.notify(&Observation::RoleChange {
            role,
            term: self.current_term,
        });

        let is_leader = role == RaftRole::Leader;
        if was_leader != is_leader {
            self.leadership_tx.send_replace(is_leader);
        }
        if was_leader {
            self.peers.clear();
            if let Some(pending) = self.pending_change.take() {
                let err = if role == RaftRole::Shutdown {
                    WardenError::Shutdown
                } else {
                    WardenError::NotLeader { leader: None }
                };
                let _ = pending.reply.send(Err(err));
            }
        }
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader == leader {
            return;
        }
        info!(
            node_id = %self.id,
            leader = leader.as_ref().map(NodeId::as_str).unwrap_or(""),
            term = self.current_term,
            "leader changed"
        );
        self.leader = leader.clone();
        self.publish_status();
        self.observers.notify(&Observation::LeaderChange {
            leader,
            term: self.current_term,
        });
    }

    async fn persist(&self) -> Result<()> {
        self.storage
            .save_state(self.current_term, self.voted_for.as_ref(), self.log.entries())
            .await
    }

    /// Moves to follower, adopting `term` if it is newer.
    async fn step_down(&mut self, term: u64) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.set_leader(None);
            self.persist().await?;
        }
        self.set_role(RaftRole::Follower);
        self.reset_election_deadline();
        Ok(())
    }

    fn notify_configuration(&self, before: &Configuration) {
        let latest = self.log.latest_configuration();
        if latest != before {
            info!(node_id = %self.id, members = latest.len(), voters = latest.voter_count(), "cluster configuration changed");
            self.publish_status();
            self.observers.notify(&Observation::PeerConfigurationChange {
                configuration: latest.clone(),
            });
        }
    }

    // ---- timers ----

    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.role {
            RaftRole::Leader => {
                self.check_lease(now);
                if self.role == RaftRole::Leader {
                    self.replicate_all(false);
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if now >= self.election_deadline {
                    if self.log.latest_configuration().is_voter(&self.id) {
                        self.start_election().await?;
                    } else {
                        self.reset_election_deadline();
                    }
                }
            }
            RaftRole::Shutdown => {}
        }
        Ok(())
    }

    /// Steps down when a quorum of voters has not answered within the lease.
    fn check_lease(&mut self, now: Instant) {
        let configuration = self.log.latest_configuration();
        let lease = self.config.leader_lease_timeout;
        let mut live = 0;
        for voter in configuration.voters() {
            if voter.id == self.id {
                live += 1;
            } else if let Some(progress) = self.peers.get(&voter.id) {
                if now.duration_since(progress.last_contact) <= lease {
                    live += 1;
                }
            }
        }
        if live < configuration.quorum_size() {
            warn!(
                node_id = %self.id,
                term = self.current_term,
                live,
                quorum = configuration.quorum_size(),
                "failed to contact quorum, stepping down"
            );
            self.set_leader(None);
            self.set_role(RaftRole::Follower);
            self.reset_election_deadline();
        }
    }

    // ---- elections ----

    async fn start_election(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.set_leader(None);
        self.set_role(RaftRole::Candidate);
        self.persist().await?;
        self.reset_election_deadline();

        self.votes.clear();
        self.votes.insert(self.id.clone());

        info!(node_id = %self.id, term = self.current_term, "starting election");

        if self.has_vote_quorum() {
            return self.become_leader().await;
        }

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        let voters: Vec<ClusterMember> = self
            .log
            .latest_configuration()
            .voters()
            .filter(|m| m.id != self.id)
            .cloned()
            .collect();

        for voter in voters {
            let transport = self.transport.clone();
            let outcomes = self.outcomes_tx.clone();
            let request = RpcRequest::RequestVote(request.clone());
            let rpc_timeout = self.config.rpc_timeout;
            let term = self.current_term;
            tokio::spawn(async move {
                let result = call_peer(transport.as_ref(), &voter, request, rpc_timeout)
                    .await
                    .and_then(|response| match response {
                        RpcResponse::RequestVote(r) => Ok(r),
                        other => Err(unexpected(&other)),
                    });
                let _ = outcomes.send(RpcOutcome::Vote {
                    peer: voter.id,
                    term,
                    result,
                });
            });
        }
        Ok(())
    }

    fn has_vote_quorum(&self) -> bool {
        let configuration = self.log.latest_configuration();
        let granted = self
            .votes
            .iter()
            .filter(|id| configuration.is_voter(id))
            .count();
        granted >= configuration.quorum_size()
    }

    async fn become_leader(&mut self) -> Result<()> {
        info!(node_id = %self.id, term = self.current_term, "became leader");
        // Leader id first, so the status is complete when leadership is announced
        self.set_leader(Some(self.id.clone()));
        self.set_role(RaftRole::Leader);
        self.last_leader_contact = None;

        self.peers.clear();
        self.sync_peers();

        let entry = LogEntry::blank(self.log.last_index() + 1, self.current_term);
        self.log.append(entry);
        self.persist().await?;

        self.replicate_all(true);
        self.advance_commit().await
    }

    /// Aligns the replication set with the latest configuration.
    fn sync_peers(&mut self) {
        let now = Instant::now();
        let next_index = self.log.last_index() + 1;
        let heartbeat = self.config.heartbeat_interval;
        let configuration = self.log.latest_configuration();

        self.peers
            .retain(|id, _| configuration.contains(id) && *id != self.id);
        for member in &configuration.members {
            if member.id == self.id {
                continue;
            }
            self.peers
                .entry(member.id.clone())
                .and_modify(|p| p.address = member.address.clone())
                .or_insert_with(|| {
                    PeerProgress::new(member.address.clone(), next_index, now, heartbeat)
                });
        }
    }

    // ---- replication ----

    fn replicate_all(&mut self, force: bool) {
        let now = Instant::now();
        let last_index = self.log.last_index();
        let heartbeat = self.config.heartbeat_interval;
        let due: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                !p.inflight
                    && (force
                        || (!p.failing && p.next_index <= last_index)
                        || now.duration_since(p.last_sent) >= heartbeat)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for peer in due {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &NodeId) {
        let Some(progress) = self.peers.get_mut(peer) else {
            return;
        };
        if progress.inflight {
            return;
        }
        progress.inflight = true;
        progress.last_sent = Instant::now();

        let target = ClusterMember::voter(peer.clone(), progress.address.clone());
        let transport = self.transport.clone();
        let outcomes = self.outcomes_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let term = self.current_term;

        if progress.next_index <= self.log.snapshot_index() {
            let Some(snapshot) = self.snapshot.clone() else {
                error!(node_id = %self.id, peer = %peer, "peer needs a snapshot but none is stored");
                progress.inflight = false;
                return;
            };
            let last_index = snapshot.last_index;
            debug!(node_id = %self.id, peer = %peer, last_index, "sending snapshot");
            let request = RpcRequest::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader: self.id.clone(),
                snapshot,
            });
            tokio::spawn(async move {
                let result = call_peer(transport.as_ref(), &target, request, rpc_timeout)
                    .await
                    .and_then(|response| match response {
                        RpcResponse::InstallSnapshot(r) => Ok(r),
                        other => Err(unexpected(&other)),
                    });
                let _ = outcomes.send(RpcOutcome::Snapshot {
                    peer: target.id,
                    term,
                    last_index,
                    result,
                });
            });
            return;
        }

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(progress.next_index, self.config.max_append_entries);
        let last_sent = prev_log_index + entries.len() as u64;
        let request = RpcRequest::AppendEntries(AppendEntriesRequest {
            term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        });

        tokio::spawn(async move {
            let result = call_peer(transport.as_ref(), &target, request, rpc_timeout)
                .await
                .and_then(|response| match response {
                    RpcResponse::AppendEntries(r) => Ok(r),
                    other => Err(unexpected(&other)),
                });
            let _ = outcomes.send(RpcOutcome::Append {
                peer: target.id,
                term,
                last_sent,
                result,
            });
        });
    }

    fn record_contact(&mut self, peer: &NodeId) {
        let Some(progress) = self.peers.get_mut(peer) else {
            return;
        };
        progress.last_contact = Instant::now();
        progress.failures = 0;
        if progress.failing {
            progress.failing = false;
            info!(node_id = %self.id, peer = %peer, "heartbeat resumed");
            self.observers
                .notify(&Observation::ResumedHeartbeat { peer: peer.clone() });
        }
    }

    fn record_failure(&mut self, peer: &NodeId, error: &WardenError) {
        let Some(progress) = self.peers.get_mut(peer) else {
            return;
        };
        progress.failures += 1;
        if !progress.failing {
            progress.failing = true;
            warn!(node_id = %self.id, peer = %peer, error = %error, "failed to contact peer");
            self.observers.notify(&Observation::FailedHeartbeat {
                peer: peer.clone(),
                failures: progress.failures,
            });
        } else {
            debug!(node_id = %self.id, peer = %peer, failures = progress.failures, error = %error, "peer still unreachable");
        }
    }

    async fn handle_outcome(&mut self, outcome: RpcOutcome) -> Result<()> {
        match outcome {
            RpcOutcome::Vote { peer, term, result } => {
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(node_id = %self.id, peer = %peer, error = %e, "vote request failed");
                        return Ok(());
                    }
                };
                if response.term > self.current_term {
                    return self.step_down(response.term).await;
                }
                if self.role != RaftRole::Candidate || term != self.current_term || !response.granted {
                    return Ok(());
                }
                debug!(node_id = %self.id, peer = %peer, term, "vote granted");
                self.votes.insert(peer);
                if self.has_vote_quorum() {
                    self.become_leader().await?;
                }
                Ok(())
            }

            RpcOutcome::Append {
                peer,
                term,
                last_sent,
                result,
            } => {
                if let Some(progress) = self.peers.get_mut(&peer) {
                    progress.inflight = false;
                }
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        self.record_failure(&peer, &e);
                        return Ok(());
                    }
                };
                self.record_contact(&peer);
                if response.term > self.current_term {
                    return self.step_down(response.term).await;
                }
                if self.role != RaftRole::Leader || term != self.current_term {
                    return Ok(());
                }

                let last_index = self.log.last_index();
                let Some(progress) = self.peers.get_mut(&peer) else {
                    return Ok(());
                };
                if response.success {
                    progress.match_index = progress.match_index.max(last_sent);
                    progress.next_index = progress.match_index + 1;
                } else {
                    progress.next_index = progress
                        .next_index
                        .saturating_sub(1)
                        .min(response.last_log_index + 1)
                        .max(1);
                    debug!(node_id = %self.id, peer = %peer, next_index = progress.next_index, "append rejected, backing off");
                }
                let more = progress.next_index <= last_index;

                if response.success {
                    self.advance_commit().await?;
                }
                if more && self.role == RaftRole::Leader {
                    self.send_append(&peer);
                }
                Ok(())
            }

            RpcOutcome::Snapshot {
                peer,
                term,
                last_index,
                result,
            } => {
                if let Some(progress) = self.peers.get_mut(&peer) {
                    progress.inflight = false;
                }
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        self.record_failure(&peer, &e);
                        return Ok(());
                    }
                };
                self.record_contact(&peer);
                if response.term > self.current_term {
                    return self.step_down(response.term).await;
                }
                if self.role != RaftRole::Leader || term != self.current_term {
                    return Ok(());
                }
                let log_last = self.log.last_index();
                let more = match self.peers.get_mut(&peer) {
                    Some(progress) => {
                        progress.match_index = progress.match_index.max(last_index);
                        progress.next_index = progress.match_index + 1;
                        progress.next_index <= log_last
                    }
                    None => false,
                };
                if more {
                    self.send_append(&peer);
                }
                self.advance_commit().await
            }
        }
    }

    /// Commits the highest current-term index stored on a quorum of voters.
    async fn advance_commit(&mut self) -> Result<()> {
        if self.role != RaftRole::Leader {
            return Ok(());
        }
        let configuration = self.log.latest_configuration();
        let quorum = configuration.quorum_size();
        let mut index = self.log.last_index();
        let mut new_commit = None;

        while index > self.commit_index {
            match self.log.term_at(index) {
                Some(term) if term == self.current_term => {
                    let acks = configuration
                        .voters()
                        .filter(|m| {
                            m.id == self.id
                                || self
                                    .peers
                                    .get(&m.id)
                                    .map(|p| p.match_index >= index)
                                    .unwrap_or(false)
                        })
                        .count();
                    if acks >= quorum {
                        new_commit = Some(index);
                        break;
                    }
                }
                _ => break,
            }
            index -= 1;
        }

        if let Some(index) = new_commit {
            debug!(node_id = %self.id, commit_index = index, "advanced commit index");
            self.commit_index = index;
            self.apply_committed().await?;
        }
        Ok(())
    }

    async fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index).cloned() else {
                break;
            };
            self.state_machine.apply(&entry).await?;
            self.last_applied = index;
            if entry.as_configuration().is_some() {
                debug!(node_id = %self.id, index, "configuration committed");
            }
        }

        if let Some(pending) = self.pending_change.take() {
            if pending.index <= self.commit_index {
                let _ = pending.reply.send(Ok(()));
            } else {
                self.pending_change = Some(pending);
            }
        }

        if self.role == RaftRole::Leader
            && self.log.latest_configuration_index() <= self.commit_index
            && !self.log.latest_configuration().contains(&self.id)
        {
            info!(node_id = %self.id, "removed from configuration, stepping down");
            self.set_leader(None);
            self.set_role(RaftRole::Follower);
            self.reset_election_deadline();
        }

        self.maybe_snapshot().await
    }

    async fn maybe_snapshot(&mut self) -> Result<()> {
        if self.last_applied < self.log.snapshot_index() + self.config.snapshot_threshold {
            return Ok(());
        }
        let index = self.last_applied;
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };
        let data = self.state_machine.snapshot().await?;
        let snapshot = Snapshot::new(index, term, self.log.configuration_at(index).clone(), data);

        self.storage.save_snapshot(&snapshot).await?;
        self.log.compact(index);
        self.snapshot = Some(snapshot);
        self.persist().await?;

        info!(node_id = %self.id, last_index = index, last_term = term, "compacted log into snapshot");
        Ok(())
    }

    // ---- inbound rpc ----

    async fn handle_inbound(&mut self, rpc: InboundRpc) {
        let InboundRpc { request, reply } = rpc;
        let name = request.name();
        match self.handle_rpc(request).await {
            Ok(response) => {
                let _ = reply.send(response);
            }
            Err(e) => {
                warn!(node_id = %self.id, rpc = name, error = %e, "failed to handle rpc");
            }
        }
    }

    async fn handle_rpc(&mut self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::RequestVote(req) => self.handle_request_vote(req).await.map(RpcResponse::RequestVote),
            RpcRequest::AppendEntries(req) => self
                .handle_append_entries(req)
                .await
                .map(RpcResponse::AppendEntries),
            RpcRequest::InstallSnapshot(req) => self
                .handle_install_snapshot(req)
                .await
                .map(RpcResponse::InstallSnapshot),
        }
    }

    fn has_live_leader(&self, now: Instant) -> bool {
        self.role == RaftRole::Leader
            || self
                .last_leader_contact
                .map(|t| now.duration_since(t) < self.config.election_timeout)
                .unwrap_or(false)
    }

    async fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let deny = |term| RequestVoteResponse {
            term,
            granted: false,
        };

        if req.term < self.current_term {
            return Ok(deny(self.current_term));
        }

        // A node that hears from a live leader ignores candidates. This keeps
        // partitioned or removed servers from forcing elections.
        if self.has_live_leader(Instant::now()) && self.leader.as_ref() != Some(&req.candidate) {
            debug!(node_id = %self.id, candidate = %req.candidate, term = req.term, "rejecting vote, leader is live");
            return Ok(deny(self.current_term));
        }

        if req.term > self.current_term {
            self.step_down(req.term).await?;
        }

        let can_vote = match &self.voted_for {
            None => true,
            Some(id) => id == &req.candidate,
        };
        let up_to_date = self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        if !(can_vote && up_to_date) {
            return Ok(deny(self.current_term));
        }

        self.voted_for = Some(req.candidate.clone());
        self.persist().await?;
        self.reset_election_deadline();
        debug!(node_id = %self.id, candidate = %req.candidate, term = self.current_term, "granted vote");

        Ok(RequestVoteResponse {
            term: self.current_term,
            granted: true,
        })
    }

    /// Accepts `leader` as the leader of `term` and resets the election timer.
    async fn follow(&mut self, term: u64, leader: NodeId) -> Result<()> {
        if term > self.current_term || self.role != RaftRole::Follower {
            self.step_down(term).await?;
        }
        self.set_leader(Some(leader));
        self.last_leader_contact = Some(Instant::now());
        self.reset_election_deadline();
        Ok(())
    }

    async fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let reject = |term, last_log_index| AppendEntriesResponse {
            term,
            success: false,
            last_log_index,
        };

        if req.term < self.current_term {
            return Ok(reject(self.current_term, self.log.last_index()));
        }
        self.follow(req.term, req.leader.clone()).await?;

        if req.prev_log_index > self.log.last_index() {
            return Ok(reject(self.current_term, self.log.last_index()));
        }
        if req.prev_log_index >= self.log.snapshot_index()
            && self.log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            let hint = req.prev_log_index.saturating_sub(1).min(self.log.last_index());
            return Ok(reject(self.current_term, hint));
        }

        let before = self.log.latest_configuration().clone();
        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut changed = false;
        for entry in req.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    debug!(node_id = %self.id, index = entry.index, "truncating conflicting entries");
                    self.log.truncate_from(entry.index);
                }
                None => {}
            }
            self.log.append(entry);
            changed = true;
        }

        if changed {
            self.persist().await?;
            self.notify_configuration(&before);
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req
                .leader_commit
                .min(last_new)
                .min(self.log.last_index())
                .max(self.commit_index);
            self.apply_committed().await?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_log_index: self.log.last_index(),
        })
    }

    async fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }
        self.follow(req.term, req.leader.clone()).await?;

        let snapshot = req.snapshot;
        if !snapshot.verify_checksum() {
            return Err(WardenError::ChecksumMismatch {
                expected: snapshot.checksum,
                actual: crc32fast::hash(&snapshot.data),
            });
        }
        if snapshot.last_index <= self.commit_index {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        info!(node_id = %self.id, last_index = snapshot.last_index, "installing snapshot from leader");
        self.storage.save_snapshot(&snapshot).await?;
        self.state_machine.restore(&snapshot.data).await?;

        let before = self.log.latest_configuration().clone();
        self.log.install_snapshot(&snapshot);
        self.commit_index = self.commit_index.max(snapshot.last_index);
        self.last_applied = snapshot.last_index;
        self.snapshot = Some(snapshot);
        self.persist().await?;
        self.notify_configuration(&before);

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    // ---- membership ----

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::ChangeMembership { change, reply } => {
                if let Err(e) = self.change_membership(change, reply).await {
                    error!(node_id = %self.id, error = %e, "membership change failed");
                }
            }
        }
    }

    async fn change_membership(
        &mut self,
        change: MembershipChange,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.role != RaftRole::Leader {
            let _ = reply.send(Err(WardenError::NotLeader {
                leader: self.leader.clone(),
            }));
            return Ok(());
        }
        if self.pending_change.is_some() || self.log.latest_configuration_index() > self.commit_index {
            let _ = reply.send(Err(WardenError::ConfigChangeInProgress));
            return Ok(());
        }

        let current = self.log.latest_configuration().clone();
        let next = match &change {
            MembershipChange::AddVoter { id, address } => {
                let member = ClusterMember::voter(id.clone(), address.clone());
                if current.get(id) == Some(&member) {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                current.with_member(member)
            }
            MembershipChange::AddNonvoter { id, address } => {
                if current.get(id).map(|m| &m.address == address).unwrap_or(false) {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                current.with_member(ClusterMember::nonvoter(id.clone(), address.clone()))
            }
            MembershipChange::RemoveServer { id } => {
                if !current.contains(id) {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                current.without_member(id)
            }
        };

        if next.voter_count() == 0 {
            let _ = reply.send(Err(WardenError::consensus(
                "configuration change would leave no voters",
            )));
            return Ok(());
        }

        let index = self.log.last_index() + 1;
        self.log
            .append(LogEntry::configuration(index, self.current_term, next));
        if let Err(e) = self.persist().await {
            self.log.truncate_from(index);
            let _ = reply.send(Err(WardenError::persistence(format!(
                "failed to persist configuration entry: {}",
                e
            ))));
            return Err(e);
        }

        info!(node_id = %self.id, ?change, index, "appended configuration change");
        self.sync_peers();
        self.notify_configuration(&current);
        self.pending_change = Some(PendingChange { index, reply });

        self.replicate_all(true);
        self.advance_commit().await
    }
}

fn unexpected(response: &RpcResponse) -> WardenError {
    WardenError::consensus(format!("unexpected rpc response: {:?}", response))
}

async fn call_peer(
    transport: &dyn RaftTransport,
    target: &ClusterMember,
    request: RpcRequest,
    rpc_timeout: Duration,
) -> Result<RpcResponse> {
    let name = request.name();
    match timeout(rpc_timeout, transport.call(&target.id, &target.address, request)).await {
        Ok(result) => result,
        Err(_) => Err(WardenError::timeout(format!("{} to {}", name, target.id))),
    }
}

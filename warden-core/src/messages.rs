//! Raft log entries and RPC messages exchanged between engines.
//!
//! Messages travel over the wire with bincode, so these types avoid serde
//! attributes that bincode cannot represent.

use crate::state_machine::Snapshot;
use crate::{Configuration, NodeId};
use serde::{Deserialize, Serialize};

/// Payload of a replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms.
    Blank,
    /// A complete cluster configuration. Takes effect as soon as it is
    /// appended.
    Configuration(Configuration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn blank(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Blank,
        }
    }

    pub fn configuration(index: u64, term: u64, configuration: Configuration) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Configuration(configuration),
        }
    }

    pub fn as_configuration(&self) -> Option<&Configuration> {
        match &self.payload {
            EntryPayload::Configuration(configuration) => Some(configuration),
            EntryPayload::Blank => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// The follower's last log index, used by the leader to back off
    /// `next_index` after a rejection.
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

impl RpcRequest {
    /// The node that issued the request.
    pub fn sender(&self) -> &NodeId {
        match self {
            RpcRequest::RequestVote(req) => &req.candidate,
            RpcRequest::AppendEntries(req) => &req.leader,
            RpcRequest::InstallSnapshot(req) => &req.leader,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "request_vote",
            RpcRequest::AppendEntries(_) => "append_entries",
            RpcRequest::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

impl RpcResponse {
    pub fn term(&self) -> u64 {
        match self {
            RpcResponse::RequestVote(resp) => resp.term,
            RpcResponse::AppendEntries(resp) => resp.term,
            RpcResponse::InstallSnapshot(resp) => resp.term,
        }
    }
}

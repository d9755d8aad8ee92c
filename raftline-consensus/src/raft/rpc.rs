use super::log::LogEntry;
use super::snapshot::SnapshotMeta;
use bytes::Bytes;
use raftline_common::{LogIndex, NodeId, Server, Term};
use serde::{Deserialize, Serialize};

/// PreVote and RequestVote share one shape: Candidate → Peer.
///
/// For a pre-vote `term` is the term the candidate would campaign in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,             // Leader’s term
    pub leader_id: NodeId,      // Leader's ID
    pub prev_log_index: u64,    // Index of log entry before new ones
    pub prev_log_term: Term,    // Term of that entry
    pub entries: Vec<LogEntry>, // New log entries to store
    pub leader_commit: u64,     // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Responder's last log index; lets the leader skip ahead when backing off.
    pub last_log_index: LogIndex,
}

/// One chunk of a snapshot file. A snapshot without files is sent as a single
/// request with `file_name: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub file_name: Option<String>,
    pub offset: u64,
    pub data: Bytes,
    pub is_first: bool,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLeaderCommitIndexRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLeaderCommitIndexResponse {
    pub term: Term,
    /// false when the responder is not the leader; `commit_index` is then its own.
    pub is_leader: bool,
    pub commit_index: LogIndex,
}

//
// Client-facing messages
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResCode {
    Success,
    Fail,
    NotLeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLeaderRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLeaderResponse {
    pub res_code: ResCode,
    pub leader: Option<Server>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetConfigurationRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigurationResponse {
    pub res_code: ResCode,
    pub leader: Option<Server>,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeersRequest {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeersResponse {
    pub res_code: ResCode,
    pub res_msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovePeersRequest {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovePeersResponse {
    pub res_code: ResCode,
    pub res_msg: String,
}

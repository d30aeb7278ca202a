//! RPC message shapes and the wire/on-disk data model.
//!
//! Mirrors the teacher's `protos.rs`: plain serde-derived structs with no
//! behavior, shared by the transport, the persistent store, and the node.

use serde::{Deserialize, Serialize};

/// Process identity. The source material identifies replicas by a bare
/// name (`"A"`, `"B"`, ...) rather than a numeric id, so this crate follows
/// suit instead of the teacher's monotonically-assigned `u64` (membership
/// changes that would require that allocation scheme are out of scope here).
pub type NodeId = String;

pub type Term = u64;

pub type LogIndex = u64;

/// A single entry in the replicated log. The index is never stored on the
/// entry itself; it is implied by position, as described by the data model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn sentinel(term: Term) -> Self {
        LogEntry { term, data: None }
    }
}

/// The contents of `<base>.conf`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub commit_index: LogIndex,
    #[serde(default)]
    pub snapshot_version: u64,
    #[serde(default)]
    pub last_applied: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub snapshot_version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub snapshot_version: u64,
}

/// `prev_log_index`/`prev_log_term`/`entries`/`leader_commit` are optional
/// because a snapshot-install message carries none of them (see the
/// decision order of `append_entries`, §4.8.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_log_index: Option<LogIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_log_term: Option<Term>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<LogEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_commit: Option<LogIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    pub snapshot_version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub snapshot_version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LogIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<NodeId>,
}

/// Diagnostic `show` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShowResponse {
    pub id: NodeId,
    pub role: String,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: usize,
    pub peers: Vec<NodeId>,
    pub voted_for: Option<NodeId>,
    pub snapshot_version: u64,
}

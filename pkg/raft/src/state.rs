//! Volatile per-role state.
//!
//! Mirrors the teacher's `state.rs`: plain data held by whichever role is
//! currently active, swapped wholesale by the node on every role
//! transition. Behavior lives in [`crate::node`]; this module only holds
//! the shape of each role's bookkeeping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protos::{LogIndex, NodeId};

#[derive(Debug)]
pub struct FollowerState {
    pub election_timeout: Duration,
    pub last_message_time: Instant,
    pub last_leader_id: Option<NodeId>,
}

#[derive(Debug)]
pub struct CandidateState {
    pub election_start: Instant,
    pub election_timeout: Duration,
    pub votes_received: HashSet<NodeId>,
    pub found_better_leader: bool,
}

#[derive(Debug)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub snapshot_index: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex, snapshot_version: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        let mut snapshot_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), 0);
            snapshot_index.insert(peer.clone(), snapshot_version);
        }
        LeaderState {
            next_index,
            match_index,
            snapshot_index,
        }
    }
}

/// The active role of a node. Role transition is a wholesale swap of this
/// enum under the node's lock; any timer or RPC still referencing the
/// previous role's epoch sees a mismatch and returns silently (see
/// `role_epoch` in [`crate::node`]).
#[derive(Debug)]
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

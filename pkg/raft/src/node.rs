//! The Raft node: shared state, RPC dispatch, role transitions, and
//! log/commit management.
//!
//! The node owns one [`std::sync::Mutex`] guarding every piece of mutable
//! persistent and volatile state. Unlike the reentrant lock described by
//! the source material, `std::sync::Mutex` is not reentrant, so handlers
//! here acquire it only for the duration of an in-memory mutation and
//! release it before any blocking network call (election fan-out,
//! replication pass): state needed for the call is read into an owned
//! value first, and the response is folded back in under a fresh
//! acquisition. This preserves every invariant the lock exists to protect
//! while avoiding a self-deadlock (see §5 of the design spec).
//!
//! Role transitions bump a `role_epoch` counter; every timer closure
//! captures the epoch it was scheduled under and checks it against the
//! node's current epoch on wake-up, so a stale timer from a role the node
//! has since left is a silent no-op rather than requiring explicit
//! cancellation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::config::NodeConfig;
use crate::errors::{Error, Result};
use crate::protos::{
    AppendEntriesRequest, AppendEntriesResponse, AppendEntryResponse, LogEntry, LogIndex,
    NodeId, PersistedConfig, RequestVoteRequest, RequestVoteResponse, ResultsResponse,
    ShowResponse, SnapshotResponse, Term,
};
use crate::state::{CandidateState, FollowerState, LeaderState, Role};
use crate::state_machine::StateMachine;
use crate::store::PersistentStore;
use crate::transport::{RpcHandler, Transport};

/// Timer durations, read once from [`NodeConfig::timing`] at startup.
/// Production defaults match the protocol's specified values; tests
/// shrink these to avoid waiting on multi-second real-time timeouts.
struct Timing {
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    housekeeping_interval: Duration,
    snapshot_commit_threshold: LogIndex,
}

impl Timing {
    fn from_config(config: &crate::config::TimingConfig) -> Self {
        Timing {
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            housekeeping_interval: Duration::from_millis(config.housekeeping_interval_ms),
            snapshot_commit_threshold: config.snapshot_commit_threshold,
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

struct NodeInner {
    id: NodeId,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    snapshot_version: u64,
    commit_index: LogIndex,
    last_applied: LogIndex,
    role: Role,
    role_epoch: u64,
    store: PersistentStore,
    state_machine: Box<dyn StateMachine>,
}

pub struct Node {
    id: NodeId,
    peers: Vec<NodeId>,
    inner: Mutex<NodeInner>,
    transport: Arc<dyn Transport>,
    scheduler: crate::scheduler::Scheduler,
    timing: Timing,
    self_ref: OnceLock<Weak<Node>>,
}

impl Node {
    /// Loads persistent state, replays the committed prefix into the state
    /// machine, and starts the node as a Follower.
    pub fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<Arc<Node>> {
        let (store, log, conf) = PersistentStore::open(config.base_path.clone())?;

        if let Some(snapshot) = store.read_snapshot()? {
            state_machine.reset(snapshot);
        }

        let commands: Vec<Value> = log
            .iter()
            .skip(1)
            .take(conf.commit_index as usize)
            .filter_map(|e| e.data.clone())
            .collect();
        if !commands.is_empty() {
            state_machine.apply(&commands);
        }

        let current_term = log.last().map(|e| e.term).unwrap_or(0);
        let peers = config.peer_ids();
        let timing = Timing::from_config(&config.timing);

        let inner = NodeInner {
            id: config.id.clone(),
            current_term,
            voted_for: None,
            log,
            snapshot_version: conf.snapshot_version,
            commit_index: conf.commit_index,
            last_applied: conf.commit_index,
            role: Role::Follower(FollowerState {
                election_timeout: timing.random_election_timeout(),
                last_message_time: Instant::now(),
                last_leader_id: None,
            }),
            role_epoch: 0,
            store,
            state_machine,
        };

        let node = Arc::new(Node {
            id: config.id,
            peers,
            inner: Mutex::new(inner),
            transport,
            scheduler: crate::scheduler::Scheduler::new(),
            timing,
            self_ref: OnceLock::new(),
        });
        let _ = node.self_ref.set(Arc::downgrade(&node));

        node.as_follower();

        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    fn arc(&self) -> Arc<Node> {
        self.self_ref
            .get()
            .expect("node self-reference not yet initialized")
            .upgrade()
            .expect("node dropped while still in use")
    }

    fn majority_size(&self) -> usize {
        let total = self.peers.len() + 1;
        total / 2 + 1
    }

    fn fatal(err: Error) -> ! {
        tracing::error!(error = %err, "fatal persistence failure; terminating");
        std::process::exit(1);
    }

    // ---- role transitions (§4.8.4) -----------------------------------

    pub fn as_follower(&self) {
        let (epoch, timeout) = {
            let mut inner = self.inner.lock().unwrap();
            inner.role_epoch += 1;
            let epoch = inner.role_epoch;
            let timeout = self.timing.random_election_timeout();
            inner.role = Role::Follower(FollowerState {
                election_timeout: timeout,
                last_message_time: Instant::now(),
                last_leader_id: None,
            });
            tracing::info!(id = %self.id, term = inner.current_term, "became follower");
            (epoch, timeout)
        };
        self.schedule_election_timer(epoch, timeout);
    }

    pub fn as_candidate(&self) {
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            inner.role_epoch += 1;
            let epoch = inner.role_epoch;
            inner.role = Role::Candidate(CandidateState {
                election_start: Instant::now(),
                election_timeout: self.timing.random_election_timeout(),
                votes_received: HashSet::new(),
                found_better_leader: false,
            });
            tracing::info!(id = %self.id, "became candidate");
            epoch
        };
        // Deferred onto the scheduler thread (delay zero) so that the
        // election fan-out always runs serialized with other timers,
        // mirroring the source material's `schedule(0, start_election)`.
        let weak = Arc::downgrade(&self.arc());
        self.scheduler.schedule(Duration::from_millis(0), move || {
            if let Some(node) = weak.upgrade() {
                node.start_election(epoch);
            }
        });
    }

    fn as_leader(&self, expected_epoch: u64) {
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch != expected_epoch {
                return;
            }
            inner.role_epoch += 1;
            let epoch = inner.role_epoch;
            let last_log_index = (inner.log.len() - 1) as LogIndex;
            inner.role = Role::Leader(LeaderState::new(&self.peers, last_log_index, inner.snapshot_version));
            tracing::info!(id = %self.id, term = inner.current_term, "became leader");
            epoch
        };
        self.schedule_heartbeat(epoch, self.timing.heartbeat_interval);
        self.schedule_housekeeping(epoch, self.timing.housekeeping_interval);
    }

    // ---- follower timer (§4.5) ----------------------------------------

    fn schedule_election_timer(&self, epoch: u64, delay: Duration) {
        let weak = Arc::downgrade(&self.arc());
        self.scheduler.schedule(delay, move || {
            if let Some(node) = weak.upgrade() {
                node.on_election_timeout(epoch);
            }
        });
    }

    fn on_election_timeout(&self, epoch: u64) {
        let mut become_candidate = false;
        let mut reschedule = None;
        {
            let inner = self.inner.lock().unwrap();
            if inner.role_epoch != epoch {
                return;
            }
            if let Role::Follower(ref s) = inner.role {
                let elapsed = Instant::now().duration_since(s.last_message_time);
                if elapsed >= s.election_timeout {
                    become_candidate = true;
                } else {
                    reschedule = Some(s.election_timeout - elapsed);
                }
            }
        }
        if become_candidate {
            self.as_candidate();
        } else if let Some(delay) = reschedule {
            self.schedule_election_timer(epoch, delay);
        }
    }

    // ---- candidate election (§4.6) -------------------------------------

    fn start_election(&self, epoch: u64) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch != epoch {
                return;
            }
            inner.current_term += 1;
            inner.voted_for = Some(self.id.clone());
            let last_log_index = (inner.log.len() - 1) as LogIndex;
            let last_log_term = inner.log[last_log_index as usize].term;
            tracing::info!(id = %self.id, term = inner.current_term, "starting election");
            (
                inner.current_term,
                last_log_index,
                last_log_term,
                inner.snapshot_version,
            )
        };
        let (term, last_log_index, last_log_term, snapshot_version) = snapshot;

        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
            snapshot_version,
        };

        let mut votes = 1usize; // self

        for peer in self.peers.clone().iter() {
            if self.is_stale_or_beaten(epoch) {
                return;
            }

            let body = serde_json::to_value(&request).unwrap();
            if let Some(reply) = self.transport.call(peer, "request_vote", body) {
                if let Ok(resp) = serde_json::from_value::<RequestVoteResponse>(reply) {
                    if resp.vote_granted {
                        votes += 1;
                        let mut inner = self.inner.lock().unwrap();
                        if inner.role_epoch == epoch {
                            if let Role::Candidate(ref mut s) = inner.role {
                                s.votes_received.insert(peer.clone());
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(id = %self.id, term, votes, "election round complete");

        if self.is_stale_or_beaten(epoch) {
            return;
        }

        if votes >= self.majority_size() {
            self.as_leader(epoch);
            return;
        }

        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch != epoch {
                return;
            }
            match &mut inner.role {
                Role::Candidate(s) => {
                    s.election_timeout = self.timing.random_election_timeout();
                    Some(s.election_timeout)
                }
                _ => None,
            }
        };
        if let Some(delay) = delay {
            let weak = Arc::downgrade(&self.arc());
            self.scheduler.schedule(delay, move || {
                if let Some(node) = weak.upgrade() {
                    node.start_election(epoch);
                }
            });
        }
    }

    /// True if the node has moved on from `epoch`, or — while still in
    /// `epoch` as a Candidate — has seen a concurrent RPC that makes it
    /// defer to a better leader.
    fn is_stale_or_beaten(&self, epoch: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.role_epoch != epoch {
            return true;
        }
        matches!(&inner.role, Role::Candidate(s) if s.found_better_leader)
    }

    // ---- leader heartbeat / replication (§4.7) -------------------------

    fn schedule_heartbeat(&self, epoch: u64, delay: Duration) {
        let weak = Arc::downgrade(&self.arc());
        self.scheduler.schedule(delay, move || {
            if let Some(node) = weak.upgrade() {
                node.on_heartbeat(epoch);
            }
        });
    }

    fn on_heartbeat(&self, epoch: u64) {
        if !self.still_leader(epoch) {
            return;
        }
        self.replicate_once(epoch);
        self.schedule_heartbeat(epoch, self.timing.heartbeat_interval);
    }

    fn schedule_housekeeping(&self, epoch: u64, delay: Duration) {
        let weak = Arc::downgrade(&self.arc());
        self.scheduler.schedule(delay, move || {
            if let Some(node) = weak.upgrade() {
                node.on_housekeeping(epoch);
            }
        });
    }

    fn on_housekeeping(&self, epoch: u64) {
        if !self.still_leader(epoch) {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch == epoch && inner.commit_index >= self.timing.snapshot_commit_threshold {
                if let Err(e) = take_snapshot_locked(&mut inner) {
                    drop(inner);
                    Self::fatal(e);
                }
            }
        }
        self.schedule_housekeeping(epoch, self.timing.housekeeping_interval);
    }

    fn still_leader(&self, epoch: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.role_epoch == epoch && matches!(inner.role, Role::Leader(_))
    }

    /// One replication pass over every peer, followed by commit
    /// advancement. Each peer is handled sequentially: its current
    /// `next_index`/`match_index`/`snapshot_index` are read, the request
    /// is issued without holding the lock, and the reply is folded back
    /// in before moving to the next peer (mirroring the source
    /// material's sequential `update_replicas` loop).
    fn replicate_once(&self, epoch: u64) {
        let peers = self.peers.clone();

        for peer in &peers {
            if !self.still_leader(epoch) {
                return;
            }

            enum Plan {
                Snapshot {
                    term: Term,
                    snapshot: Value,
                    snapshot_version: u64,
                },
                Entries {
                    term: Term,
                    prev_log_index: LogIndex,
                    prev_log_term: Term,
                    entries: Vec<LogEntry>,
                    leader_commit: LogIndex,
                    snapshot_version: u64,
                },
            }

            let plan = {
                let inner = self.inner.lock().unwrap();
                let leader_state = match &inner.role {
                    Role::Leader(s) => s,
                    _ => return,
                };
                let peer_snapshot_index = *leader_state.snapshot_index.get(peer).unwrap_or(&0);
                if peer_snapshot_index != inner.snapshot_version {
                    Plan::Snapshot {
                        term: inner.current_term,
                        snapshot: inner.state_machine.snapshot(),
                        snapshot_version: inner.snapshot_version,
                    }
                } else {
                    let next = *leader_state.next_index.get(peer).unwrap_or(&1);
                    let prev = next.saturating_sub(1);
                    let prev_term = inner.log.get(prev as usize).map(|e| e.term).unwrap_or(0);
                    let entries = inner.log[(prev as usize + 1).min(inner.log.len())..].to_vec();
                    Plan::Entries {
                        term: inner.current_term,
                        prev_log_index: prev,
                        prev_log_term: prev_term,
                        entries,
                        leader_commit: inner.commit_index,
                        snapshot_version: inner.snapshot_version,
                    }
                }
            };

            let is_snapshot_plan = matches!(plan, Plan::Snapshot { .. });

            let request = match &plan {
                Plan::Snapshot {
                    term,
                    snapshot,
                    snapshot_version,
                } => AppendEntriesRequest {
                    term: *term,
                    leader_id: self.id.clone(),
                    prev_log_index: None,
                    prev_log_term: None,
                    entries: None,
                    leader_commit: None,
                    snapshot: Some(snapshot.clone()),
                    snapshot_version: *snapshot_version,
                },
                Plan::Entries {
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                    snapshot_version,
                } => AppendEntriesRequest {
                    term: *term,
                    leader_id: self.id.clone(),
                    prev_log_index: Some(*prev_log_index),
                    prev_log_term: Some(*prev_log_term),
                    entries: Some(entries.clone()),
                    leader_commit: Some(*leader_commit),
                    snapshot: None,
                    snapshot_version: *snapshot_version,
                },
            };

            let body = serde_json::to_value(&request).unwrap();
            let reply = self
                .transport
                .call(peer, "append_entries", body)
                .and_then(|v| serde_json::from_value::<AppendEntriesResponse>(v).ok());

            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch != epoch {
                return;
            }
            let log_len = inner.log.len() as LogIndex;
            let current_snapshot_version = inner.snapshot_version;
            let leader_state = match &mut inner.role {
                Role::Leader(s) => s,
                _ => return,
            };
            match &reply {
                None => {
                    let next = leader_state.next_index.entry(peer.clone()).or_insert(1);
                    if *next > 1 {
                        *next -= 1;
                    }
                }
                Some(resp) => {
                    if is_snapshot_plan {
                        leader_state.next_index.insert(peer.clone(), log_len);
                        leader_state.match_index.insert(peer.clone(), 0);
                    } else if resp.success {
                        leader_state.next_index.insert(peer.clone(), log_len);
                        leader_state
                            .match_index
                            .insert(peer.clone(), log_len.saturating_sub(1));
                    } else if resp.snapshot_version < current_snapshot_version {
                        leader_state.next_index.insert(peer.clone(), 1);
                    }
                    leader_state
                        .snapshot_index
                        .insert(peer.clone(), resp.snapshot_version);
                }
            }
        }

        self.advance_commit_index(epoch);
    }

    fn advance_commit_index(&self, epoch: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.role_epoch != epoch {
            return;
        }

        let current_term = inner.current_term;
        let commit_index = inner.commit_index;
        let log_len = inner.log.len() as LogIndex;
        let majority = self.majority_size();
        let peers = self.peers.clone();

        let found = {
            let leader_state = match &inner.role {
                Role::Leader(s) => s,
                _ => return,
            };
            let mut found: Option<LogIndex> = None;
            let mut candidate = log_len.saturating_sub(1);
            loop {
                if candidate <= commit_index {
                    break;
                }
                let term_at_candidate = inner.log[candidate as usize].term;
                if term_at_candidate == current_term {
                    // The leader always matches its own log.
                    let mut count = 1usize;
                    for peer in &peers {
                        if *leader_state.match_index.get(peer).unwrap_or(&0) >= candidate {
                            count += 1;
                        }
                    }
                    if count >= majority {
                        found = Some(candidate);
                        break;
                    }
                } else if term_at_candidate < current_term {
                    // Terms are monotonic going backwards through the log,
                    // so no earlier entry can be in the current term either.
                    break;
                }
                candidate -= 1;
            }
            found
        };

        if let Some(m) = found {
            if m > inner.commit_index {
                if let Err(e) = apply_committed_locked(&mut inner, m) {
                    drop(inner);
                    Self::fatal(e);
                }
            }
        }
    }

    // ---- shared RPC handlers (§4.8) ------------------------------------

    pub fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut inner = self.inner.lock().unwrap();

        if let Role::Follower(ref mut s) = inner.role {
            s.last_message_time = Instant::now();
        }

        let granted = vote_should_grant(&inner, &req);
        if granted {
            inner.voted_for = Some(req.candidate_id.clone());
            inner.current_term = req.term;
            tracing::info!(id = %self.id, candidate = %req.candidate_id, term = req.term, "granted vote");
        }

        let response = RequestVoteResponse {
            term: inner.current_term,
            vote_granted: granted,
            snapshot_version: inner.snapshot_version,
        };

        let mut step_down = false;
        if granted {
            if let Role::Candidate(ref mut s) = inner.role {
                s.found_better_leader = true;
                step_down = true;
            }
        }
        drop(inner);

        if step_down {
            self.as_follower();
        }

        response
    }

    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let is_follower = matches!(self.inner.lock().unwrap().role, Role::Follower(_));

        if is_follower {
            let gate_ok = {
                let mut inner = self.inner.lock().unwrap();
                let ok = inner.voted_for.as_deref() == Some(req.leader_id.as_str());
                if let Role::Follower(ref mut s) = inner.role {
                    s.last_message_time = Instant::now();
                    if ok {
                        s.last_leader_id = Some(req.leader_id.clone());
                    }
                }
                ok
            };
            if !gate_ok {
                let inner = self.inner.lock().unwrap();
                return AppendEntriesResponse {
                    term: inner.current_term,
                    success: false,
                    snapshot_version: inner.snapshot_version,
                };
            }
            return self.append_entries_shared(req);
        }

        let is_candidate = matches!(self.inner.lock().unwrap().role, Role::Candidate(_));
        let response = self.append_entries_shared(req);

        if is_candidate && response.success {
            let step_down = {
                let mut inner = self.inner.lock().unwrap();
                if let Role::Candidate(ref mut s) = inner.role {
                    s.found_better_leader = true;
                    true
                } else {
                    false
                }
            };
            if step_down {
                self.as_follower();
            }
        }

        response
    }

    fn append_entries_shared(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut inner = self.inner.lock().unwrap();

        if req.snapshot_version > inner.snapshot_version {
            if let Some(snapshot) = req.snapshot.clone() {
                inner.state_machine.reset(snapshot);
                let new_conf = PersistedConfig {
                    snapshot_version: req.snapshot_version,
                    commit_index: 0,
                    last_applied: 0,
                };
                let image = inner.state_machine.snapshot();
                if let Err(e) = inner.store.install_snapshot(&image, &new_conf, &[]) {
                    drop(inner);
                    Self::fatal(e);
                }
                inner.snapshot_version = req.snapshot_version;
                let term = inner.current_term;
                inner.log = vec![LogEntry::sentinel(term)];
                inner.commit_index = 0;
                inner.last_applied = 0;
                tracing::info!(id = %self.id, version = req.snapshot_version, "installed snapshot from leader");
            }
            return AppendEntriesResponse {
                term: inner.current_term,
                success: false,
                snapshot_version: inner.snapshot_version,
            };
        }

        if req.snapshot_version < inner.snapshot_version {
            return AppendEntriesResponse {
                term: inner.current_term,
                success: false,
                snapshot_version: inner.snapshot_version,
            };
        }

        if req.term < inner.current_term {
            return AppendEntriesResponse {
                term: inner.current_term,
                success: false,
                snapshot_version: inner.snapshot_version,
            };
        }

        let prev_log_index = req.prev_log_index.unwrap_or(0);
        let prev_log_term = req.prev_log_term.unwrap_or(0);

        if prev_log_index as usize >= inner.log.len()
            || inner.log[prev_log_index as usize].term != prev_log_term
        {
            return AppendEntriesResponse {
                term: inner.current_term,
                success: false,
                snapshot_version: inner.snapshot_version,
            };
        }

        if let Some(entries) = req.entries.clone() {
            if !entries.is_empty() {
                let start = prev_log_index as usize + 1;
                let mut conflict_at = None;
                for (i, e) in entries.iter().enumerate() {
                    let idx = start + i;
                    if idx >= inner.log.len() {
                        break;
                    }
                    if inner.log[idx].term != e.term {
                        conflict_at = Some(idx);
                        break;
                    }
                }

                if let Some(idx) = conflict_at {
                    if let Err(e) = inner.store.truncate_suffix(idx) {
                        drop(inner);
                        Self::fatal(e);
                    }
                    inner.log.truncate(idx);
                }

                let already_present = inner.log.len().saturating_sub(start);
                for e in entries.iter().skip(already_present) {
                    if let Err(err) = inner.store.append_entry(e) {
                        drop(inner);
                        Self::fatal(err);
                    }
                    inner.log.push(e.clone());
                }
            }
        }

        if let Some(leader_commit) = req.leader_commit {
            if leader_commit > inner.commit_index {
                let new_commit = leader_commit.min((inner.log.len() - 1) as LogIndex);
                if new_commit > inner.commit_index {
                    if let Err(e) = apply_committed_locked(&mut inner, new_commit) {
                        drop(inner);
                        Self::fatal(e);
                    }
                }
            }
        }

        AppendEntriesResponse {
            term: inner.current_term,
            success: true,
            snapshot_version: inner.snapshot_version,
        }
    }

    // ---- client-facing RPCs (role-dependent) ---------------------------

    pub fn handle_append_entry(&self, command: Value) -> AppendEntryResponse {
        let epoch = {
            let inner = self.inner.lock().unwrap();
            match &inner.role {
                Role::Leader(_) => Some(inner.role_epoch),
                _ => None,
            }
        };

        let epoch = match epoch {
            Some(e) => e,
            None => {
                let inner = self.inner.lock().unwrap();
                return match &inner.role {
                    Role::Follower(_) => AppendEntryResponse {
                        success: false,
                        id: None,
                        redirect: inner.voted_for.clone(),
                    },
                    _ => AppendEntryResponse {
                        success: false,
                        id: None,
                        redirect: None,
                    },
                };
            }
        };

        let k = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role_epoch != epoch || !matches!(inner.role, Role::Leader(_)) {
                return AppendEntryResponse {
                    success: false,
                    id: None,
                    redirect: None,
                };
            }
            let entry = LogEntry {
                term: inner.current_term,
                data: Some(command),
            };
            let k = inner.log.len() as LogIndex;
            if let Err(e) = inner.store.append_entry(&entry) {
                drop(inner);
                Self::fatal(e);
            }
            inner.log.push(entry);
            k
        };

        self.replicate_once(epoch);

        let committed = {
            let inner = self.inner.lock().unwrap();
            inner.commit_index >= k
        };

        AppendEntryResponse {
            success: committed,
            id: Some(k),
            redirect: None,
        }
    }

    pub fn handle_results(&self, query: Value) -> ResultsResponse {
        let inner = self.inner.lock().unwrap();
        match &inner.role {
            Role::Leader(_) => ResultsResponse {
                success: true,
                data: Some(inner.state_machine.query(&query)),
                redirect: None,
            },
            Role::Follower(_) => ResultsResponse {
                success: false,
                data: None,
                redirect: inner.voted_for.clone(),
            },
            Role::Candidate(_) => ResultsResponse {
                success: false,
                data: None,
                redirect: None,
            },
        }
    }

    pub fn handle_snapshot_rpc(&self) -> SnapshotResponse {
        let epoch = {
            let inner = self.inner.lock().unwrap();
            match &inner.role {
                Role::Leader(_) => Some(inner.role_epoch),
                _ => None,
            }
        };

        match epoch {
            Some(epoch) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.role_epoch != epoch || !matches!(inner.role, Role::Leader(_)) {
                    return SnapshotResponse {
                        success: false,
                        redirect: None,
                    };
                }
                if let Err(e) = take_snapshot_locked(&mut inner) {
                    drop(inner);
                    Self::fatal(e);
                }
                SnapshotResponse {
                    success: true,
                    redirect: None,
                }
            }
            None => {
                let inner = self.inner.lock().unwrap();
                match &inner.role {
                    Role::Follower(_) => SnapshotResponse {
                        success: false,
                        redirect: inner.voted_for.clone(),
                    },
                    _ => SnapshotResponse {
                        success: false,
                        redirect: None,
                    },
                }
            }
        }
    }

    pub fn handle_show(&self) -> ShowResponse {
        let inner = self.inner.lock().unwrap();
        ShowResponse {
            id: self.id.clone(),
            role: inner.role.name().to_string(),
            term: inner.current_term,
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            log_len: inner.log.len(),
            peers: self.peers.clone(),
            voted_for: inner.voted_for.clone(),
            snapshot_version: inner.snapshot_version,
        }
    }
}

impl RpcHandler for Node {
    fn handle_rpc(&self, service: &str, body: Value) -> Option<Value> {
        let response = match service {
            "request_vote" => {
                let req: RequestVoteRequest = serde_json::from_value(body).ok()?;
                serde_json::to_value(self.handle_request_vote(req))
            }
            "append_entries" => {
                let req: AppendEntriesRequest = serde_json::from_value(body).ok()?;
                serde_json::to_value(self.handle_append_entries(req))
            }
            "append_entry" => serde_json::to_value(self.handle_append_entry(body)),
            "results" => serde_json::to_value(self.handle_results(body)),
            "snapshot" => serde_json::to_value(self.handle_snapshot_rpc()),
            "show" => serde_json::to_value(self.handle_show()),
            _ => return None,
        };
        response.ok()
    }
}

/// §4.8.1: grant iff the request's term is not stale, we haven't voted for
/// someone else this term (or we're voting for ourselves, per the
/// documented — and deliberately preserved — quirk in the source
/// material), the candidate's log is at least as up to date as ours, and
/// its snapshot cursor is not behind ours.
fn vote_should_grant(inner: &NodeInner, req: &RequestVoteRequest) -> bool {
    if req.term < inner.current_term {
        return false;
    }

    let voted_for_ok = match &inner.voted_for {
        None => true,
        Some(v) => v == &req.candidate_id || v == &inner.id,
    };
    if !voted_for_ok {
        return false;
    }

    let our_last_index = (inner.log.len() - 1) as LogIndex;
    let our_last_term = inner.log[our_last_index as usize].term;
    let up_to_date = our_last_term < req.last_log_term
        || (our_last_term == req.last_log_term && our_last_index <= req.last_log_index);
    if !up_to_date {
        return false;
    }

    inner.snapshot_version <= req.snapshot_version
}

/// §4.8.2 commit advancement and §4.7 commit advancement share this:
/// apply newly-committed entries to the state machine as one batch, then
/// persist the new commit position.
fn apply_committed_locked(inner: &mut NodeInner, new_commit_index: LogIndex) -> Result<()> {
    let prev = inner.commit_index;
    let commands: Vec<Value> = inner.log[(prev as usize + 1)..=(new_commit_index as usize)]
        .iter()
        .filter_map(|e| e.data.clone())
        .collect();

    inner.commit_index = new_commit_index;
    if !commands.is_empty() {
        inner.state_machine.apply(&commands);
    }
    inner.last_applied = new_commit_index;

    let conf = PersistedConfig {
        commit_index: inner.commit_index,
        snapshot_version: inner.snapshot_version,
        last_applied: inner.last_applied,
    };
    inner.store.save_config(&conf)
}

/// §4.8.3: compacts the log prefix `[0..=commit_index]` into a snapshot.
fn take_snapshot_locked(inner: &mut NodeInner) -> Result<()> {
    let new_version = inner.snapshot_version + inner.commit_index;
    let tail: Vec<LogEntry> = inner.log[(inner.commit_index as usize + 1)..].to_vec();
    let image = inner.state_machine.snapshot();
    let new_conf = PersistedConfig {
        snapshot_version: new_version,
        commit_index: 0,
        last_applied: 0,
    };

    inner.store.install_snapshot(&image, &new_conf, &tail)?;

    let current_term = inner.current_term;
    let mut new_log = Vec::with_capacity(tail.len() + 1);
    new_log.push(LogEntry::sentinel(current_term));
    new_log.extend(tail);
    inner.log = new_log;
    inner.snapshot_version = new_version;
    inner.commit_index = 0;
    inner.last_applied = 0;

    Ok(())
}

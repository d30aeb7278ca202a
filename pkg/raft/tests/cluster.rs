//! End-to-end tests driven over [`raft::transport::LoopbackTransport`].
//!
//! Timer durations are shrunk well below the production defaults so these
//! run in well under a second; `raft::node::Node::handle_show` (called
//! in-process, not over the wire) is used as the test oracle rather than
//! adding any test-only introspection surface to the node itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use raft::config::{NodeConfig, PeerConfig, TimingConfig};
use raft::kv::KeyValueStateMachine;
use raft::node::Node;
use raft::transport::{LoopbackHandle, LoopbackTransport, RpcHandler};

fn fast_timing() -> TimingConfig {
    TimingConfig {
        election_timeout_min_ms: 80,
        election_timeout_max_ms: 160,
        heartbeat_interval_ms: 40,
        housekeeping_interval_ms: 10_000,
        snapshot_commit_threshold: 1_000,
    }
}

struct Cluster {
    nodes: Vec<Arc<Node>>,
    net: Arc<LoopbackTransport>,
    // Keeps each node's on-disk directory alive for the cluster's lifetime.
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    fn start(n: usize, timing: TimingConfig) -> Self {
        let net = LoopbackTransport::new();
        let ids: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let peers = ids
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, peer_id)| PeerConfig {
                    id: peer_id.clone(),
                    address: "unused:0".to_string(),
                })
                .collect();
            let config = NodeConfig {
                id: id.clone(),
                base_path: dir.path().join("node"),
                peers,
                bind: "0.0.0.0:0".to_string(),
                timing: timing.clone(),
            };
            let transport = Arc::new(LoopbackHandle {
                self_id: id.clone(),
                inner: net.clone(),
            });
            let node = Node::start(config, transport, Box::new(KeyValueStateMachine::new())).unwrap();
            let handler: Arc<dyn RpcHandler> = node.clone();
            net.register(id.clone(), Arc::downgrade(&handler));
            nodes.push(node);
            dirs.push(dir);
        }

        Cluster {
            nodes,
            net,
            _dirs: dirs,
        }
    }

    fn leader_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.handle_show().role == "leader")
    }

    fn wait_for_leader(&self, timeout: Duration) -> usize {
        wait_until(timeout, || self.leader_index().is_some());
        self.leader_index().expect("no leader elected in time")
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= timeout {
            return check();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn election_produces_exactly_one_leader() {
    let cluster = Cluster::start(3, fast_timing());
    let leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let leader_term = cluster.nodes[leader_idx].handle_show().term;

    let leaders_in_term = cluster
        .nodes
        .iter()
        .filter(|n| {
            let show = n.handle_show();
            show.role == "leader" && show.term == leader_term
        })
        .count();
    assert_eq!(leaders_in_term, 1);
}

#[test]
fn committed_entry_is_applied_on_every_reachable_node() {
    let cluster = Cluster::start(3, fast_timing());
    let leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let leader = &cluster.nodes[leader_idx];

    let response = leader.handle_append_entry(serde_json::json!({"op": "set", "key": "x", "val": 7}));
    assert!(response.success, "leader with a reachable majority must commit");

    for node in &cluster.nodes {
        let query = node.handle_results(serde_json::json!("x"));
        if node.handle_show().role == "leader" {
            assert_eq!(query.data, Some(serde_json::json!(7)));
        }
    }

    // Followers apply asynchronously only with respect to the leader's own
    // return (the leader's replication pass already pushed to them
    // synchronously over the loopback transport), so this should already
    // hold without any additional wait.
    for node in &cluster.nodes {
        assert!(node.handle_show().commit_index >= 1);
    }
}

#[test]
fn leader_cannot_commit_while_partitioned_from_majority() {
    let cluster = Cluster::start(3, fast_timing());
    let leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let leader_id = cluster.nodes[leader_idx].id().clone();

    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != leader_idx {
            cluster.net.partition(&leader_id, node.id());
        }
    }

    let response = cluster.nodes[leader_idx]
        .handle_append_entry(serde_json::json!({"op": "set", "key": "y", "val": 1}));
    assert!(!response.success, "an isolated leader cannot reach a majority");
}

#[test]
fn partition_heals_and_the_stranded_entry_replicates() {
    let cluster = Cluster::start(3, fast_timing());
    let leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let leader_id = cluster.nodes[leader_idx].id().clone();

    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != leader_idx {
            cluster.net.partition(&leader_id, node.id());
        }
    }
    let response = cluster.nodes[leader_idx]
        .handle_append_entry(serde_json::json!({"op": "set", "key": "z", "val": 5}));
    let k = response.id.expect("leader still assigns a log index while isolated");
    assert!(!response.success);

    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != leader_idx {
            cluster.net.heal(&leader_id, node.id());
        }
    }

    let committed = wait_until(Duration::from_secs(2), || {
        cluster.nodes[leader_idx].handle_show().commit_index >= k
    });
    assert!(committed, "entry should replicate once the partition heals");
}

#[test]
fn original_leader_losing_contact_triggers_a_new_election() {
    let cluster = Cluster::start(3, fast_timing());
    let first_leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let first_leader_id = cluster.nodes[first_leader_idx].id().clone();
    let first_term = cluster.nodes[first_leader_idx].handle_show().term;

    for (i, node) in cluster.nodes.iter().enumerate() {
        if i != first_leader_idx {
            cluster.net.partition(&first_leader_id, node.id());
        }
    }

    let elected = wait_until(Duration::from_secs(3), || {
        cluster.nodes.iter().enumerate().any(|(i, n)| {
            i != first_leader_idx
                && n.handle_show().role == "leader"
                && n.handle_show().term > first_term
        })
    });
    assert!(elected, "the reachable majority must elect a new leader");
}

#[test]
fn snapshot_compaction_shrinks_the_log_and_propagates_to_followers() {
    let mut timing = fast_timing();
    timing.snapshot_commit_threshold = 3;
    timing.housekeeping_interval_ms = 50;

    let cluster = Cluster::start(3, timing);
    let leader_idx = cluster.wait_for_leader(Duration::from_secs(2));
    let leader = &cluster.nodes[leader_idx];

    for i in 0..4 {
        let response = leader.handle_append_entry(serde_json::json!({"op": "set", "key": "k", "val": i}));
        assert!(response.success);
    }

    let compacted = wait_until(Duration::from_secs(2), || leader.handle_show().snapshot_version > 0);
    assert!(compacted, "leader should compact its log once past the commit threshold");

    let new_version = leader.handle_show().snapshot_version;
    let followers_caught_up = wait_until(Duration::from_secs(2), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.handle_show().snapshot_version == new_version)
    });
    assert!(followers_caught_up, "followers should pick up the new snapshot via replication");

    for node in &cluster.nodes {
        let query = node.handle_results(serde_json::json!("k"));
        if node.handle_show().role == "leader" {
            assert_eq!(query.data, Some(serde_json::json!(3)));
        }
    }
}

#[test]
fn restart_recovers_committed_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("solo");
    let config = || NodeConfig {
        id: "solo".to_string(),
        base_path: base_path.clone(),
        peers: vec![],
        bind: "0.0.0.0:0".to_string(),
        timing: fast_timing(),
    };

    let net = LoopbackTransport::new();
    let transport = Arc::new(LoopbackHandle {
        self_id: "solo".to_string(),
        inner: net.clone(),
    });
    let node = Node::start(config(), transport, Box::new(KeyValueStateMachine::new())).unwrap();

    wait_until(Duration::from_secs(2), || node.handle_show().role == "leader");
    let response = node.handle_append_entry(serde_json::json!({"op": "set", "key": "a", "val": 42}));
    assert!(response.success);
    drop(node);

    let net2 = LoopbackTransport::new();
    let transport2 = Arc::new(LoopbackHandle {
        self_id: "solo".to_string(),
        inner: net2,
    });
    let recovered = Node::start(config(), transport2, Box::new(KeyValueStateMachine::new())).unwrap();

    let recovered_commit = recovered.handle_show().commit_index;
    assert!(recovered_commit >= 1);

    wait_until(Duration::from_secs(2), || recovered.handle_show().role == "leader");
    let query = recovered.handle_results(serde_json::json!("a"));
    assert_eq!(query.data, Some(serde_json::json!(42)));
}

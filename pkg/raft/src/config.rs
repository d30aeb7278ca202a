//! Node configuration: process identity, peer addresses, the base path for
//! persistent files, and (via generics at construction time) the
//! state-machine plugin.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::protos::NodeId;

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub base_path: PathBuf,
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(flatten)]
    pub timing: TimingConfig,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Tunable timer durations. Defaults match the production values; tests
/// that exercise elections or replication end to end override these to
/// avoid waiting on multi-second real-time timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    #[serde(default = "default_snapshot_commit_threshold")]
    pub snapshot_commit_threshold: u64,
}

fn default_election_timeout_min_ms() -> u64 {
    10_000
}
fn default_election_timeout_max_ms() -> u64 {
    20_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_housekeeping_interval_ms() -> u64 {
    120_000
}
fn default_snapshot_commit_threshold() -> u64 {
    100
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            snapshot_commit_threshold: default_snapshot_commit_threshold(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&contents).map_err(Error::from)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn peer_addresses(&self) -> std::collections::HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|p| (p.id.clone(), p.address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"id":"a","base_path":"/tmp/raft/a","peers":[{"id":"b","address":"127.0.0.1:9001"}]}"#,
        )
        .unwrap();
        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.id, "a");
        assert_eq!(config.peer_ids(), vec!["b".to_string()]);
        assert_eq!(config.bind, "0.0.0.0:8000");
    }
}

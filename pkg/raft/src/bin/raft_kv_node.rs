//! Demo binary: runs a single node with the example key-value state
//! machine, wired to the other peers over HTTP.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use raft::config::NodeConfig;
use raft::kv::KeyValueStateMachine;
use raft::node::Node;
use raft::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "raft-kv-node", about = "A single node of a replicated key-value store")]
struct Args {
    /// Path to the node's JSON configuration file.
    #[arg(long)]
    config: std::path::PathBuf,
}

fn main() -> raft::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = NodeConfig::from_file(&args.config)?;
    let bind = config.bind.clone();

    let transport = Arc::new(HttpTransport::new(config.peer_addresses(), Duration::from_millis(2_000)));
    let state_machine = Box::new(KeyValueStateMachine::new());

    let node = Node::start(config, transport, state_machine)?;

    raft::server::serve(&bind, node).map_err(|e| raft::Error::Config(e.to_string()))
}

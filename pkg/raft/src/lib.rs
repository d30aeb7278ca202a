//! A Raft-style replicated consensus node.
//!
//! The crate is organized the way the consensus core of a larger system
//! would be: a crash-safe [`store`] substrate, a single-threaded
//! [`scheduler`] for role timers, a pluggable [`transport`], a pluggable
//! [`state_machine`], and the [`node`] that ties them together and
//! implements the Raft protocol itself.

pub mod config;
pub mod errors;
pub mod kv;
pub mod node;
pub mod protos;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod state_machine;
pub mod store;
pub mod transport;

pub use errors::{Error, Result};
pub use node::Node;
pub use protos::NodeId;

//! One-shot request/response RPC between replicas.
//!
//! A [`Transport`] is a thin, synchronous wrapper: given a peer, a service
//! name, and a request body, it returns the peer's response or `None` on
//! any failure (timeout, connection error, non-success status, malformed
//! body). Callers must treat `None` as "no reply" and never as a positive
//! or negative answer in its own right.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;

use crate::protos::NodeId;

pub trait Transport: Send + Sync {
    fn call(&self, peer: &NodeId, service: &str, body: Value) -> Option<Value>;
}

/// Anything that can answer an inbound RPC by service name. Implemented by
/// [`crate::node::Node`]; kept as a trait here so the transport module
/// doesn't need to depend on the node module.
pub trait RpcHandler: Send + Sync {
    fn handle_rpc(&self, service: &str, body: Value) -> Option<Value>;
}

/// Blocking HTTP transport. One POST per call, to `http://<address>/<service>`.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    addresses: HashMap<NodeId, String>,
}

impl HttpTransport {
    pub fn new(addresses: HashMap<NodeId, String>, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build http client");
        HttpTransport { client, addresses }
    }
}

impl Transport for HttpTransport {
    fn call(&self, peer: &NodeId, service: &str, body: Value) -> Option<Value> {
        let address = self.addresses.get(peer)?;
        let url = format!("http://{}/{}", address, service);
        let response = self.client.post(&url).json(&body).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().ok()
    }
}

/// In-process transport used by tests and the simulated-network property
/// tests: dispatches directly to registered handlers, with support for
/// injecting partitions between a pair of ids.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: Mutex<HashMap<NodeId, Weak<dyn RpcHandler>>>,
    partitioned: RwLock<std::collections::HashSet<(NodeId, NodeId)>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, handler: Weak<dyn RpcHandler>) {
        self.handlers.lock().unwrap().insert(id, handler);
    }

    /// Drops all calls from `a` to `b` and from `b` to `a` until healed.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut p = self.partitioned.write().unwrap();
        p.insert((a.clone(), b.clone()));
        p.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut p = self.partitioned.write().unwrap();
        p.remove(&(a.clone(), b.clone()));
        p.remove(&(b.clone(), a.clone()));
    }

    fn is_partitioned(&self, from: &NodeId, to: &NodeId) -> bool {
        self.partitioned
            .read()
            .unwrap()
            .contains(&(from.clone(), to.clone()))
    }
}

/// A caller-scoped view of a [`LoopbackTransport`] that knows its own id,
/// so `partition`/`heal` checks know which direction to apply.
pub struct LoopbackHandle {
    pub self_id: NodeId,
    pub inner: Arc<LoopbackTransport>,
}

impl Transport for LoopbackHandle {
    fn call(&self, peer: &NodeId, service: &str, body: Value) -> Option<Value> {
        if self.inner.is_partitioned(&self.self_id, peer) {
            return None;
        }
        let handler = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers.get(peer)?.upgrade()
        }?;
        handler.handle_rpc(service, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl RpcHandler for Echo {
        fn handle_rpc(&self, _service: &str, body: Value) -> Option<Value> {
            Some(body)
        }
    }

    #[test]
    fn loopback_delivers_when_not_partitioned() {
        let net = LoopbackTransport::new();
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        net.register("b".to_string(), Arc::downgrade(&echo));
        let handle = LoopbackHandle {
            self_id: "a".to_string(),
            inner: net,
        };
        let resp = handle.call(&"b".to_string(), "ping", serde_json::json!(1));
        assert_eq!(resp, Some(serde_json::json!(1)));
    }

    #[test]
    fn loopback_drops_when_partitioned() {
        let net = LoopbackTransport::new();
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        net.register("b".to_string(), Arc::downgrade(&echo));
        net.partition(&"a".to_string(), &"b".to_string());
        let handle = LoopbackHandle {
            self_id: "a".to_string(),
            inner: net,
        };
        let resp = handle.call(&"b".to_string(), "ping", serde_json::json!(1));
        assert_eq!(resp, None);
    }
}

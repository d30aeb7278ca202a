//! Thin inbound HTTP server.
//!
//! Every request is `POST /<service>` with a JSON body; the path segment
//! names the RPC (`request_vote`, `append_entries`, `append_entry`,
//! `results`, `snapshot`, `show`). The server itself holds no Raft state —
//! it decodes the body, hands it to an [`RpcHandler`], and encodes
//! whatever comes back. Malformed bodies and unknown services both yield a
//! 400, matching the "respond with an error status" requirement rather
//! than silently dropping the request the way a transport failure would.

use std::io::Read;
use std::sync::Arc;

use crate::transport::RpcHandler;

/// Serves RPCs for `handler` on `bind` until the process exits. Blocks the
/// calling thread; callers typically run this on its own thread or as the
/// entire body of `main`.
pub fn serve(bind: &str, handler: Arc<dyn RpcHandler>) -> std::io::Result<()> {
    let server = tiny_http::Server::http(bind)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    tracing::info!(bind, "raft rpc server listening");

    for mut request in server.incoming_requests() {
        let service = request.url().trim_start_matches('/').to_string();

        let mut body = String::new();
        if let Err(e) = request.as_reader().read_to_string(&mut body) {
            tracing::warn!(error = %e, "failed to read request body");
            let _ = request.respond(tiny_http::Response::empty(400));
            continue;
        }

        let parsed: Result<serde_json::Value, _> = if body.trim().is_empty() {
            Ok(serde_json::Value::Null)
        } else {
            serde_json::from_str(&body)
        };

        let parsed = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, service, "malformed rpc body");
                let _ = request.respond(tiny_http::Response::empty(400));
                continue;
            }
        };

        match handler.handle_rpc(&service, parsed) {
            Some(value) => {
                let payload = serde_json::to_vec(&value).unwrap_or_default();
                let response = tiny_http::Response::from_data(payload).with_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .unwrap(),
                );
                let _ = request.respond(response);
            }
            None => {
                tracing::warn!(service, "unknown rpc or handler returned no response");
                let _ = request.respond(tiny_http::Response::empty(400));
            }
        }
    }

    Ok(())
}

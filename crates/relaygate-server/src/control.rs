//! Requests the gateway answers itself instead of forwarding: everything on
//! the control path that is not a tunnel upgrade, plus `/favicon.ico`.
//!
//! Besides health and ephemeral identities, the control path exposes the RPC
//! bridge over HTTP: `rpc` calls a method on the tenant for the request's
//! `Host`, `srpc` relays a peer envelope and waits for the answer, `message`
//! relays one as a notification.

use crate::server::Gateway;
use relaygate_core::http::simple_response;
use relaygate_core::rpc::PeerEnvelope;
use relaygate_core::{GateError, RequestHead};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

fn not_found() -> Vec<u8> {
    simple_response(404, "Not Found", "text/plain", b"not found")
}

fn internal_error() -> Vec<u8> {
    simple_response(500, "Internal Server Error", "text/plain", b"error")
}

fn bad_request(message: &str) -> Vec<u8> {
    json_response(400, "Bad Request", &json!({ "error": message }))
}

fn json_response(status: u16, reason: &str, value: &Value) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(body) => simple_response(status, reason, "application/json", &body),
        Err(e) => {
            warn!(error = %e, "failed to encode control response");
            internal_error()
        }
    }
}

/// HTTP answer for a failed bridge call.
fn rpc_failure(error: &GateError) -> Vec<u8> {
    let (status, reason) = match error {
        GateError::Timeout => (504, "Gateway Timeout"),
        GateError::NotFound(_) => (404, "Not Found"),
        GateError::InvalidMessage(_) => (400, "Bad Request"),
        GateError::PermissionDenied(_) => (403, "Forbidden"),
        _ => (501, "Not Implemented"),
    };
    json_response(status, reason, &json!({ "error": error.to_string() }))
}

/// Body of a `POST <control>/rpc` request.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    params: Vec<Value>,
}

/// Path component of a request target, without query or fragment.
pub fn request_path(url: &str) -> &str {
    let end = url.find(|c| c == '?' || c == '#').unwrap_or(url.len());
    &url[..end]
}

/// Whether `path` is the control path or below it.
pub fn is_control_path(path: &str, control_path: &str) -> bool {
    path == control_path
        || path
            .strip_prefix(control_path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Build the full response for a control request with its complete body.
pub async fn respond(gw: &Gateway, head: &RequestHead, body: &[u8]) -> Vec<u8> {
    let control_path = gw.config.control_path();
    let path = request_path(&head.url);
    let sub = path
        .strip_prefix(control_path.as_str())
        .unwrap_or_default()
        .trim_end_matches('/');

    match (head.method.as_str(), sub) {
        ("GET", "/health") => simple_response(200, "OK", "text/plain", b"ok"),
        ("POST", "/dyn") => create_identity(gw).await,
        ("POST", "/rpc") => call_tenant(gw, head, body).await,
        ("POST", "/srpc") => relay_envelope(gw, body, false).await,
        ("POST", "/message") => relay_envelope(gw, body, true).await,
        _ => not_found(),
    }
}

async fn create_identity(gw: &Gateway) -> Vec<u8> {
    match gw.identities.create_ephemeral().await {
        Ok(identity) => match serde_json::to_vec(&identity) {
            Ok(body) => simple_response(201, "Created", "application/json", &body),
            Err(e) => {
                warn!(error = %e, "failed to encode identity");
                internal_error()
            }
        },
        Err(GateError::NotAvailable(reason)) => {
            debug!(reason = %reason, "ephemeral identity unavailable");
            not_found()
        }
        Err(e) => {
            warn!(error = %e, "ephemeral identity creation failed");
            internal_error()
        }
    }
}

async fn call_tenant(gw: &Gateway, head: &RequestHead, body: &[u8]) -> Vec<u8> {
    let Some(hostname) = head.host.as_deref() else {
        return bad_request("missing host");
    };
    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return bad_request(&format!("expected {{method, params}}: {e}")),
    };

    debug!(hostname = %hostname, method = %request.method, "control rpc");
    match gw.bridge.call(hostname, &request.method, request.params).await {
        Ok(result) => json_response(200, "OK", &result),
        Err(e) => {
            debug!(hostname = %hostname, error = %e, "control rpc failed");
            rpc_failure(&e)
        }
    }
}

async fn relay_envelope(gw: &Gateway, body: &[u8], notify: bool) -> Vec<u8> {
    let mut envelope: PeerEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => return bad_request(&format!("bad peer envelope: {e}")),
    };
    if notify {
        envelope.msg.id = None;
    }

    match gw.bridge.peer_rpc_to_client(envelope).await {
        Ok(result) => json_response(200, "OK", &result),
        Err(e) => {
            debug!(error = %e, notify, "control peer relay failed");
            rpc_failure(&e)
        }
    }
}

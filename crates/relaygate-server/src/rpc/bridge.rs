//! Gateway-side RPC: calling into tenants, relaying tenant-to-tenant calls,
//! and the methods the gateway itself serves to tenants.

use super::peer::{MethodFuture, RpcMethods};
use crate::relay::{Broker, TenantRegistry};
use relaygate_core::rpc::PeerEnvelope;
use relaygate_core::{topic, GateError, GateResult, RpcTransport};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Method a tenant serves for relayed peer calls.
pub const PEER_RPC_METHOD: &str = "peerRpc";

/// Publishes a tenant's outgoing RPC frames on `msg/<hostname>/srpc`.
pub struct TopicTransport {
    broker: Arc<Broker>,
    topic: String,
}

impl TopicTransport {
    pub fn new(broker: Arc<Broker>, hostname: &str) -> Self {
        Self {
            broker,
            topic: topic::srpc_outbound(hostname),
        }
    }
}

impl RpcTransport for TopicTransport {
    fn send<'a>(
        &'a self,
        frame: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.broker.publish(&self.topic, &frame).await == 0 {
                return Err(GateError::Transport(format!(
                    "no subscriber on {}",
                    self.topic
                )));
            }
            Ok(())
        })
    }
}

/// Calls into connected tenants by hostname.
pub struct RpcBridge {
    tenants: Arc<TenantRegistry>,
}

impl RpcBridge {
    pub fn new(tenants: Arc<TenantRegistry>) -> Self {
        Self { tenants }
    }

    /// Call `method` on the tenant for `hostname` using its peer's timeout.
    pub async fn call(&self, hostname: &str, method: &str, params: Vec<Value>) -> GateResult<Value> {
        let tenant = self.tenant(hostname).await?;
        tenant.peer.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        hostname: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> GateResult<Value> {
        let tenant = self.tenant(hostname).await?;
        tenant.peer.call_with_timeout(method, params, timeout).await
    }

    pub async fn notify(&self, hostname: &str, method: &str, params: Vec<Value>) -> GateResult<()> {
        let tenant = self.tenant(hostname).await?;
        tenant.peer.notify(method, params).await
    }

    /// Forward a peer envelope to the tenant named by its `toHost`.
    ///
    /// An envelope whose message has no id is a notification: it is sent
    /// without waiting and acknowledged with `{method, params: []}`.
    pub async fn peer_rpc_to_client(&self, envelope: PeerEnvelope) -> GateResult<Value> {
        let to = envelope.to_hostname()?;
        let tenant = self.tenant(&to).await?;
        debug!(to = %to, from = %envelope.from_host, method = %envelope.msg.method, "relaying peer rpc");

        let method = envelope.msg.method.clone();
        let is_notification = envelope.msg.id.is_none();
        let params = vec![serde_json::to_value(&envelope)?];

        if is_notification {
            tenant.peer.notify(PEER_RPC_METHOD, params).await?;
            return Ok(json!({ "method": method, "params": [] }));
        }
        tenant.peer.call(PEER_RPC_METHOD, params).await
    }

    async fn tenant(&self, hostname: &str) -> GateResult<Arc<crate::relay::TenantHandle>> {
        self.tenants
            .get(hostname)
            .await
            .ok_or_else(|| GateError::NotFound(format!("no tenant connected for {hostname}")))
    }
}

/// Methods the gateway serves on every tenant's peer.
///
/// Holds the bridge weakly: peers live inside the tenant registry, which the
/// bridge points at.
pub struct GatewayMethods {
    bridge: Weak<RpcBridge>,
}

impl GatewayMethods {
    pub fn new(bridge: &Arc<RpcBridge>) -> Self {
        Self {
            bridge: Arc::downgrade(bridge),
        }
    }

    async fn relay(&self, caller: &str, params: Vec<Value>, force_notify: bool) -> GateResult<Value> {
        let bridge = self
            .bridge
            .upgrade()
            .ok_or_else(|| GateError::NotAvailable("gateway shutting down".into()))?;

        let raw = params
            .into_iter()
            .next()
            .ok_or_else(|| GateError::InvalidMessage("missing peer envelope".into()))?;
        let mut envelope: PeerEnvelope = serde_json::from_value(raw)
            .map_err(|e| GateError::InvalidMessage(format!("bad peer envelope: {e}")))?;

        let from = envelope.from_hostname()?;
        if from != caller {
            return Err(GateError::PermissionDenied(format!(
                "{caller} cannot relay as {from}"
            )));
        }

        if force_notify {
            envelope.msg.id = None;
        }
        bridge.peer_rpc_to_client(envelope).await
    }
}

impl RpcMethods for GatewayMethods {
    fn invoke<'a>(
        &'a self,
        caller: &'a str,
        method: &'a str,
        params: Vec<Value>,
    ) -> MethodFuture<'a> {
        Box::pin(async move {
            match method {
                "ping" => Ok(params
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| Value::String("pong".into()))),
                "peerRpc" => self.relay(caller, params, false).await,
                "peerNotify" => self.relay(caller, params, true).await,
                other => Err(GateError::Remote {
                    message: format!("method not found: {other}"),
                    code: Some(501),
                }),
            }
        })
    }
}

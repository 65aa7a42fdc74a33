//! Per-tenant RPC endpoint.
//!
//! An [`RpcPeer`] turns a one-way frame transport into calls with responses.
//! Outgoing calls get a fresh correlation id and a pending entry holding a
//! oneshot sender; the entry is removed by whichever comes first, the matching
//! response or the call timeout. Incoming calls are dispatched to an
//! [`RpcMethods`] implementation on their own task so a slow method never
//! stalls the tenant's session loop.

use relaygate_core::rpc::{RpcErrorBody, RpcFrame, RpcId};
use relaygate_core::{GateError, GateResult, RpcTransport};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

pub type MethodFuture<'a> = Pin<Box<dyn Future<Output = GateResult<Value>> + Send + 'a>>;

/// Methods a peer serves to its remote side.
pub trait RpcMethods: Send + Sync {
    /// Invoke `method` on behalf of the tenant `caller`.
    fn invoke<'a>(&'a self, caller: &'a str, method: &'a str, params: Vec<Value>)
        -> MethodFuture<'a>;
}

type PendingMap = HashMap<RpcId, oneshot::Sender<GateResult<Value>>>;

pub struct RpcPeer {
    hostname: String,
    transport: Arc<dyn RpcTransport>,
    methods: Arc<dyn RpcMethods>,
    pending: Mutex<PendingMap>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl RpcPeer {
    pub fn new(
        hostname: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
        methods: Arc<dyn RpcMethods>,
        timeout: Duration,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            transport,
            methods,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            timeout,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Call `method` with the default timeout.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> GateResult<Value> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> GateResult<Value> {
        let id = RpcId::Num(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = RpcFrame::call(id.clone(), method, params).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value: the pending table was cleared.
            Ok(Err(_)) => Err(GateError::NotFound(format!(
                "{} disconnected",
                self.hostname
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(hostname = %self.hostname, method = %method, id = %id, "rpc call timed out");
                Err(GateError::Timeout)
            }
        }
    }

    /// Fire-and-forget call. No pending entry is created.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> GateResult<()> {
        let frame = RpcFrame::notification(method, params).encode()?;
        self.transport.send(frame).await
    }

    /// Feed raw bytes received from the remote side.
    ///
    /// Malformed frames are logged and dropped.
    pub async fn receive_bytes(self: &Arc<Self>, bytes: &[u8]) {
        match RpcFrame::decode(bytes) {
            Ok(frame) => self.receive(frame).await,
            Err(e) => {
                warn!(hostname = %self.hostname, error = %e, "dropping malformed rpc frame");
            }
        }
    }

    /// Handle one decoded frame from the remote side.
    pub async fn receive(self: &Arc<Self>, frame: RpcFrame) {
        match frame {
            RpcFrame::Call { id, method, params } => self.dispatch(id, method, params),
            RpcFrame::Result { id, result } => self.resolve(id, Ok(result)).await,
            RpcFrame::Error { id, error } => {
                self.resolve(id, Err(GateError::from_remote(error.message, error.code)))
                    .await
            }
        }
    }

    async fn resolve(&self, id: RpcId, result: GateResult<Value>) {
        let sender = self.pending.lock().await.remove(&id);
        match sender {
            Some(tx) => {
                // The caller may have given up between removal and send.
                let _ = tx.send(result);
            }
            None => {
                debug!(hostname = %self.hostname, id = %id, "discarding late or unknown rpc response");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, id: Option<RpcId>, method: String, params: Vec<Value>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let result = peer.methods.invoke(&peer.hostname, &method, params).await;

            // Notifications never get a response.
            let Some(id) = id else {
                if let Err(e) = result {
                    debug!(hostname = %peer.hostname, method = %method, error = %e, "notification handler failed");
                }
                return;
            };

            let response = match result {
                Ok(result) => RpcFrame::Result { id, result },
                Err(e) => RpcFrame::Error {
                    id,
                    error: RpcErrorBody::from(&e),
                },
            };
            let sent = match response.encode() {
                Ok(bytes) => peer.transport.send(bytes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!(hostname = %peer.hostname, method = %method, error = %e, "failed to send rpc response");
            }
        });
    }

    /// Fail every in-flight call immediately. Used when the tenant goes away.
    pub async fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(GateError::NotFound(format!(
                "{} disconnected",
                self.hostname
            ))));
        }
        if count > 0 {
            debug!(hostname = %self.hostname, count, "failed pending rpc calls");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

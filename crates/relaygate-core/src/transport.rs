//! Abstract outbound transport for RPC frames.
//!
//! An RPC peer never talks to a socket directly: it hands encoded frames to a
//! [`RpcTransport`], which on the gateway publishes them on the tenant's
//! `msg/<hostname>/srpc` topic.

use crate::error::GateResult;
use std::future::Future;
use std::pin::Pin;

/// Sink for encoded RPC frames.
pub trait RpcTransport: Send + Sync {
    /// Send one encoded frame. Delivery is best-effort.
    fn send<'a>(
        &'a self,
        frame: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>>;
}

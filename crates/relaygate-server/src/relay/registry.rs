//! Tenant registry: at most one live relay session per hostname.
//!
//! Registering a hostname that is already taken swaps the entry and signals
//! the previous session to close, all under one write lock, so there is never
//! a moment with two tenants (or zero, for a reconnect) for the same name.

use crate::rpc::RpcPeer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// A live, authenticated relay session.
pub struct TenantHandle {
    pub hostname: String,
    /// Process-unique session id.
    pub conn_id: u64,
    /// RPC endpoint bound to this tenant's `srpc` topic.
    pub peer: Arc<RpcPeer>,
    pub connected_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl TenantHandle {
    /// Create a handle plus the receiver its session loop watches for
    /// forced shutdown.
    pub fn new(
        hostname: impl Into<String>,
        conn_id: u64,
        peer: Arc<RpcPeer>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = Arc::new(Self {
            hostname: hostname.into(),
            conn_id,
            peer,
            connected_at: Instant::now(),
            shutdown,
        });
        (handle, shutdown_rx)
    }

    /// Ask the session to close its connection.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("hostname", &self.hostname)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantHandle>>>,
    next_conn_id: AtomicU64,
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id for a new session.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handle`, evicting and closing any previous tenant for the
    /// same hostname. Returns the evicted handle.
    pub async fn register(&self, handle: Arc<TenantHandle>) -> Option<Arc<TenantHandle>> {
        let mut tenants = self.tenants.write().await;
        let evicted = tenants.insert(handle.hostname.clone(), handle.clone());
        if let Some(old) = &evicted {
            old.close();
            info!(
                hostname = %handle.hostname,
                old_conn = old.conn_id,
                new_conn = handle.conn_id,
                "evicted previous tenant session"
            );
        }
        info!(hostname = %handle.hostname, conn_id = handle.conn_id, "tenant registered");
        evicted
    }

    /// Remove the entry for `hostname` only if it still belongs to `conn_id`.
    pub async fn unregister(&self, hostname: &str, conn_id: u64) -> bool {
        let mut tenants = self.tenants.write().await;
        match tenants.get(hostname) {
            Some(current) if current.conn_id == conn_id => {
                tenants.remove(hostname);
                debug!(hostname = %hostname, conn_id, "tenant unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, hostname: &str) -> Option<Arc<TenantHandle>> {
        self.tenants.read().await.get(hostname).cloned()
    }

    pub async fn contains(&self, hostname: &str) -> bool {
        self.tenants.read().await.contains_key(hostname)
    }

    /// Force-close the live tenant for `hostname`, if any.
    pub async fn close(&self, hostname: &str) -> bool {
        match self.get(hostname).await {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.tenants.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::peer::tests::{ChannelTransport, EchoMethods};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn handle(
        registry: &TenantRegistry,
        hostname: &str,
    ) -> (Arc<TenantHandle>, watch::Receiver<bool>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = Arc::new(RpcPeer::new(
            hostname,
            Arc::new(ChannelTransport(tx)),
            Arc::new(EchoMethods),
            Duration::from_secs(5),
        ));
        TenantHandle::new(hostname, registry.next_conn_id(), peer)
    }

    #[tokio::test]
    async fn reconnect_evicts_previous_session() {
        let registry = TenantRegistry::new();
        let (first, first_rx) = handle(&registry, "a.example");
        let (second, second_rx) = handle(&registry, "a.example");

        assert!(registry.register(first.clone()).await.is_none());
        let evicted = registry.register(second.clone()).await.unwrap();

        assert_eq!(evicted.conn_id, first.conn_id);
        assert!(*first_rx.borrow());
        assert!(!*second_rx.borrow());
        assert_eq!(registry.count().await, 1);
        assert_eq!(
            registry.get("a.example").await.unwrap().conn_id,
            second.conn_id
        );
    }

    #[tokio::test]
    async fn stale_unregister_keeps_replacement() {
        let registry = TenantRegistry::new();
        let (first, _) = handle(&registry, "a.example");
        let (second, _) = handle(&registry, "a.example");
        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        assert!(!registry.unregister("a.example", first.conn_id).await);
        assert!(registry.contains("a.example").await);
        assert!(registry.unregister("a.example", second.conn_id).await);
        assert!(!registry.contains("a.example").await);
    }

    #[tokio::test]
    async fn close_signals_live_tenant() {
        let registry = TenantRegistry::new();
        let (tenant, rx) = handle(&registry, "a.example");
        registry.register(tenant.clone()).await;

        assert!(registry.close("a.example").await);
        assert!(*rx.borrow());
        assert!(tenant.is_closed());
        assert!(!registry.close("b.example").await);
    }
}

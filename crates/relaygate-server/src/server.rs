//! Core server: owns every registry and accepts public connections.
//!
//! One TCP port serves both external traffic and relay clients; each accepted
//! connection is handed to [`crate::connection`], which decides per request
//! head which of the two it is.

use crate::auth::{rate_limit, IdentitySettings, IdentityStore, RateLimiter};
use crate::config::ServerConfig;
use crate::connection;
use crate::relay::{Broker, TenantRegistry};
use crate::router::TopicRouter;
use crate::rpc::RpcBridge;
use crate::sockets::SocketRegistry;
use relaygate_core::{GateError, GateResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// The gateway instance.
pub struct Gateway {
    pub(crate) config: ServerConfig,
    pub(crate) sockets: Arc<SocketRegistry>,
    pub(crate) tenants: Arc<TenantRegistry>,
    pub(crate) broker: Arc<Broker>,
    pub(crate) router: TopicRouter,
    pub(crate) bridge: Arc<RpcBridge>,
    pub(crate) identities: IdentityStore,
    pub(crate) connect_limiter: Mutex<RateLimiter>,
}

impl Gateway {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let sockets = Arc::new(SocketRegistry::new());
        let tenants = Arc::new(TenantRegistry::new());
        let broker = Arc::new(Broker::new());
        let router = TopicRouter::new(sockets.clone(), broker.clone());
        let bridge = Arc::new(RpcBridge::new(tenants.clone()));

        if config.secret.is_none() {
            info!("no static secret configured, only ephemeral identities can connect");
        }
        let identities = IdentityStore::new(IdentitySettings {
            static_secret: config.secret.clone(),
            dynamic_names: config.dynamic_names,
            server_base: config.server_base.clone(),
            name_chars: config.dynamic_name_chars,
            timeout: config.dynamic_timeout,
        });
        let connect_limiter = Mutex::new(rate_limit::connect_limiter(config.max_connect_attempts));

        Arc::new(Self {
            config,
            sockets,
            tenants,
            broker,
            router,
            bridge,
            identities,
            connect_limiter,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// RPC access to connected tenants.
    pub fn bridge(&self) -> &Arc<RpcBridge> {
        &self.bridge
    }

    /// Bind the public listener.
    pub async fn bind(&self) -> GateResult<TcpListener> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        TcpListener::bind(addr)
            .await
            .map_err(|e| GateError::Transport(format!("bind {addr} failed: {e}")))
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(self: Arc<Self>) -> GateResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> GateResult<()> {
        let local = listener.local_addr()?;
        self.spawn_maintenance();

        info!(
            addr = %local,
            control_path = %self.config.control_path(),
            dynamic_names = self.config.dynamic_names,
            "relaygate ready"
        );

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let gw = self.clone();
                    tokio::spawn(async move {
                        connection::handle_connection(gw, stream, remote).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }

    /// Periodic ephemeral-identity sweep and rate limiter GC.
    fn spawn_maintenance(self: &Arc<Self>) {
        let gw = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gw) = gw.upgrade() else { break };

                if gw.config.dynamic_names {
                    gw.sweep_ephemeral_at(crate::auth::identity::now_ms()).await;
                }
                gw.connect_limiter.lock().await.gc();
            }
        });
    }

    /// Remove every ephemeral identity expired at `now_ms`, force-closing its
    /// live tenant. Returns how many identities were removed.
    pub async fn sweep_ephemeral_at(&self, now_ms: u64) -> usize {
        let expired = self.identities.expired_at(now_ms).await;
        let mut removed = 0;
        for hostname in expired {
            if self.tenants.close(&hostname).await {
                info!(hostname = %hostname, "closed tenant for expired identity");
            }
            if self.identities.remove(&hostname).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(count = removed, "swept expired ephemeral identities");
        } else {
            debug!("ephemeral sweep: nothing expired");
        }
        removed
    }
}

//! relaygate-server: multi-tenant reverse-tunnel gateway.
//!
//! Listens on a single TCP port. Relay clients hold a WebSocket open on the
//! control path and authenticate for a hostname; external HTTP requests are
//! attributed to a tenant by their `Host` header and streamed through that
//! tenant's session.

mod auth;
mod config;
mod connection;
mod control;
mod relay;
mod router;
mod rpc;
mod server;
mod sockets;
mod transport;
mod tunnel;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::Gateway;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// relaygate-server: reverse-tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "relaygate-server", version, about = "Multi-tenant reverse-tunnel gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Reserved control path segment (the tunnel endpoint lives at /<base>)
    #[arg(long, env = "RELAYGATE_BASE")]
    control_base: Option<String>,

    /// Static shared secret for tenants
    #[arg(long, env = "RELAYGATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Allow clients to request ephemeral hostnames
    #[arg(long)]
    dynamic_names: bool,

    /// Base domain for ephemeral hostnames
    #[arg(long, env = "RELAYGATE_SERVER_BASE")]
    server_base: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.relaygate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting relaygate-server");

    let overrides = ConfigOverrides {
        port: cli.port,
        bind: cli.bind,
        control_base: cli.control_base,
        secret: cli.secret,
        dynamic_names: cli.dynamic_names,
        server_base: cli.server_base,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if server_config.dynamic_names && server_config.server_base.is_none() {
        warn!("dynamic names enabled without a server base, ephemeral identities are unavailable");
    }

    let gateway = Gateway::new(server_config);

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("relaygate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

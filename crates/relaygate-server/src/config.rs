//! Server configuration: TOML file + CLI overrides.

use relaygate_core::{GateError, GateResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_control_base")]
    pub control_base: String,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Largest request body held back for a `Connection: close` request, and
    /// the largest body accepted by control routes.
    #[serde(default = "default_max_body_buffer_bytes")]
    pub max_body_buffer_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            control_base: default_control_base(),
            max_header_bytes: default_max_header_bytes(),
            max_body_buffer_bytes: default_max_body_buffer_bytes(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub dynamic_names: bool,
    #[serde(default)]
    pub server_base: Option<String>,
    #[serde(default = "default_dynamic_name_chars")]
    pub dynamic_name_chars: usize,
    #[serde(default = "default_dynamic_timeout_secs")]
    pub dynamic_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: None,
            dynamic_names: false,
            server_base: None,
            dynamic_name_chars: default_dynamic_name_chars(),
            dynamic_timeout_secs: default_dynamic_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_connect_attempts: default_max_connect_attempts(),
        }
    }
}

/// `[timeouts]` section of the config TOML. All values in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_header_parse_ms")]
    pub header_parse_ms: u64,
    #[serde(default = "default_body_wait_ms")]
    pub body_wait_ms: u64,
    #[serde(default = "default_rpc_ms")]
    pub rpc_ms: u64,
    #[serde(default = "default_tunnel_connect_ms")]
    pub tunnel_connect_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            header_parse_ms: default_header_parse_ms(),
            body_wait_ms: default_body_wait_ms(),
            rpc_ms: default_rpc_ms(),
            tunnel_connect_ms: default_tunnel_connect_ms(),
        }
    }
}

fn default_port() -> u16 {
    3101
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_control_base() -> String {
    "_hs".to_string()
}
fn default_max_header_bytes() -> usize {
    relaygate_core::http::DEFAULT_MAX_HEAD_BYTES
}
fn default_max_body_buffer_bytes() -> usize {
    1024 * 1024
}
fn default_dynamic_name_chars() -> usize {
    8
}
fn default_dynamic_timeout_secs() -> u64 {
    3 * 60 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_header_parse_ms() -> u64 {
    500
}
fn default_body_wait_ms() -> u64 {
    3000
}
fn default_rpc_ms() -> u64 {
    5000
}
fn default_tunnel_connect_ms() -> u64 {
    10_000
}

/// Values supplied on the command line (or via their environment variables).
/// `None` / `false` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub control_base: Option<String>,
    pub secret: Option<String>,
    pub dynamic_names: bool,
    pub server_base: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: IpAddr,
    /// Reserved path segment, without slashes.
    pub control_base: String,
    pub max_header_bytes: usize,
    pub max_body_buffer_bytes: usize,
    pub secret: Option<String>,
    pub dynamic_names: bool,
    pub server_base: Option<String>,
    pub dynamic_name_chars: usize,
    pub dynamic_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_connect_attempts: u32,
    pub header_parse_timeout: Duration,
    pub body_wait: Duration,
    pub rpc_timeout: Duration,
    pub tunnel_connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let file = ConfigFile::default();
        Self {
            port: file.server.port,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_base: file.server.control_base,
            max_header_bytes: file.server.max_header_bytes,
            max_body_buffer_bytes: file.server.max_body_buffer_bytes,
            secret: None,
            dynamic_names: false,
            server_base: None,
            dynamic_name_chars: file.auth.dynamic_name_chars,
            dynamic_timeout: Duration::from_secs(file.auth.dynamic_timeout_secs),
            sweep_interval: Duration::from_secs(file.auth.sweep_interval_secs),
            max_connect_attempts: file.auth.max_connect_attempts,
            header_parse_timeout: Duration::from_millis(file.timeouts.header_parse_ms),
            body_wait: Duration::from_millis(file.timeouts.body_wait_ms),
            rpc_timeout: Duration::from_millis(file.timeouts.rpc_ms),
            tunnel_connect_timeout: Duration::from_millis(file.timeouts.tunnel_connect_ms),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> GateResult<Self> {
        // Load base config from file
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> GateResult<Self> {
        // Merge CLI overrides
        let bind_str = overrides.bind.clone().unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| GateError::Other(format!("invalid bind address {bind_str:?}: {e}")))?;

        let control_base = overrides
            .control_base
            .clone()
            .unwrap_or(file.server.control_base)
            .trim_matches('/')
            .to_string();
        if control_base.is_empty() || control_base.contains('/') {
            return Err(GateError::Other(format!(
                "control base must be a single path segment, got {control_base:?}"
            )));
        }

        let secret = overrides
            .secret
            .clone()
            .or(file.auth.secret)
            .filter(|s| !s.is_empty());
        let server_base = overrides
            .server_base
            .clone()
            .or(file.auth.server_base)
            .filter(|s| !s.is_empty());

        Ok(Self {
            port: overrides.port.unwrap_or(file.server.port),
            bind,
            control_base,
            max_header_bytes: file.server.max_header_bytes,
            max_body_buffer_bytes: file.server.max_body_buffer_bytes,
            secret,
            dynamic_names: overrides.dynamic_names || file.auth.dynamic_names,
            server_base,
            dynamic_name_chars: file.auth.dynamic_name_chars.max(1),
            dynamic_timeout: Duration::from_secs(file.auth.dynamic_timeout_secs),
            sweep_interval: Duration::from_secs(file.auth.sweep_interval_secs.max(1)),
            max_connect_attempts: file.auth.max_connect_attempts,
            header_parse_timeout: Duration::from_millis(file.timeouts.header_parse_ms),
            body_wait: Duration::from_millis(file.timeouts.body_wait_ms),
            rpc_timeout: Duration::from_millis(file.timeouts.rpc_ms),
            tunnel_connect_timeout: Duration::from_millis(file.timeouts.tunnel_connect_ms),
        })
    }

    /// The reserved control path, e.g. `/_hs`.
    pub fn control_path(&self) -> String {
        format!("/{}", self.control_base)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

//! Tenant authentication: the process-wide static secret plus short-lived
//! ephemeral identities minted on demand.

use relaygate_core::secret::{generate_name, generate_secret, secrets_match};
use relaygate_core::{GateError, GateResult};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

const MAX_NAME_ATTEMPTS: usize = 16;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A generated hostname/secret pair that expires after `timeout` ms.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralIdentity {
    pub id: String,
    pub hostname: String,
    pub secret: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub timeout: u64,
}

impl EphemeralIdentity {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > self.timeout
    }
}

/// Settings for the identity store.
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub static_secret: Option<String>,
    pub dynamic_names: bool,
    pub server_base: Option<String>,
    pub name_chars: usize,
    pub timeout: Duration,
}

/// Credential checks and the ephemeral identity table.
pub struct IdentityStore {
    settings: IdentitySettings,
    ephemeral: RwLock<HashMap<String, EphemeralIdentity>>,
}

impl IdentityStore {
    pub fn new(settings: IdentitySettings) -> Self {
        Self {
            settings,
            ephemeral: RwLock::new(HashMap::new()),
        }
    }

    /// Check `secret` for `hostname`.
    ///
    /// An ephemeral identity for the hostname shadows the static secret
    /// entirely: only its own secret is accepted.
    pub async fn authenticate(&self, hostname: &str, secret: &str) -> bool {
        let mut ephemeral = self.ephemeral.write().await;
        if let Some(identity) = ephemeral.get_mut(hostname) {
            let ok = secrets_match(&identity.secret, secret);
            if ok {
                identity.last_accessed = now_ms();
            }
            debug!(hostname = %hostname, ok, "ephemeral auth");
            return ok;
        }
        drop(ephemeral);

        match &self.settings.static_secret {
            Some(expected) => secrets_match(expected, secret),
            None => false,
        }
    }

    /// Mint a new ephemeral identity under the server base domain.
    pub async fn create_ephemeral(&self) -> GateResult<EphemeralIdentity> {
        if !self.settings.dynamic_names {
            return Err(GateError::NotAvailable("dynamic names are disabled".into()));
        }
        let base = self
            .settings
            .server_base
            .as_deref()
            .ok_or_else(|| GateError::NotAvailable("no server base configured".into()))?;

        let mut ephemeral = self.ephemeral.write().await;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = generate_name(self.settings.name_chars);
            let hostname = format!("{id}.{base}");
            if ephemeral.contains_key(&hostname) {
                continue;
            }

            let now = now_ms();
            let identity = EphemeralIdentity {
                id,
                hostname: hostname.clone(),
                secret: generate_secret(),
                created_at: now,
                last_accessed: now,
                timeout: self.settings.timeout.as_millis() as u64,
            };
            ephemeral.insert(hostname.clone(), identity.clone());
            info!(hostname = %hostname, "ephemeral identity created");
            return Ok(identity);
        }

        Err(GateError::Other(
            "could not allocate a unique ephemeral name".into(),
        ))
    }

    pub async fn get(&self, hostname: &str) -> Option<EphemeralIdentity> {
        self.ephemeral.read().await.get(hostname).cloned()
    }

    pub async fn remove(&self, hostname: &str) -> Option<EphemeralIdentity> {
        self.ephemeral.write().await.remove(hostname)
    }

    /// Hostnames of identities older than their timeout at `now_ms`.
    pub async fn expired_at(&self, now_ms: u64) -> Vec<String> {
        self.ephemeral
            .read()
            .await
            .values()
            .filter(|identity| identity.is_expired_at(now_ms))
            .map(|identity| identity.hostname.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.ephemeral.read().await.len()
    }
}

//! Registry of live external sockets.
//!
//! Each accepted public connection gets a random hex id. The connection's
//! task owns the actual stream; the registry only holds a command channel
//! into that task plus the hostname the socket was attributed to, which is
//! what `reply` / `close` ownership checks compare against, and the tenant
//! session that was serving it.

use rand::Rng;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Instruction for the task owning an external socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    /// Write bytes back to the external client.
    Write(Vec<u8>),
    /// Close the connection.
    End,
    /// The tenant session serving the socket is gone.
    Orphaned,
}

struct SocketEntry {
    hostname: Option<String>,
    conn_id: Option<u64>,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<String, SocketEntry>>,
}

fn new_socket_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new socket and return its id.
    pub async fn register(&self, tx: mpsc::UnboundedSender<SocketCommand>) -> String {
        let mut sockets = self.sockets.write().await;
        let mut id = new_socket_id();
        while sockets.contains_key(&id) {
            id = new_socket_id();
        }
        sockets.insert(
            id.clone(),
            SocketEntry {
                hostname: None,
                conn_id: None,
                tx,
            },
        );
        id
    }

    /// Attribute the socket to `hostname`, served by tenant session `conn_id`.
    pub async fn bind_host(&self, socket_id: &str, hostname: &str, conn_id: u64) -> bool {
        match self.sockets.write().await.get_mut(socket_id) {
            Some(entry) => {
                entry.hostname = Some(hostname.to_string());
                entry.conn_id = Some(conn_id);
                true
            }
            None => false,
        }
    }

    /// Hostname the socket is bound to, if it exists and is bound.
    pub async fn owner(&self, socket_id: &str) -> Option<String> {
        self.sockets
            .read()
            .await
            .get(socket_id)
            .and_then(|entry| entry.hostname.clone())
    }

    pub async fn contains(&self, socket_id: &str) -> bool {
        self.sockets.read().await.contains_key(socket_id)
    }

    /// Queue bytes for the external client. False if the socket is gone.
    pub async fn write(&self, socket_id: &str, bytes: Vec<u8>) -> bool {
        self.send(socket_id, SocketCommand::Write(bytes)).await
    }

    /// Ask the socket's task to close and deregister it.
    pub async fn end(&self, socket_id: &str) -> bool {
        let entry = self.sockets.write().await.remove(socket_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(SocketCommand::End);
                debug!(socket_id = %socket_id, "socket ended by tenant");
                true
            }
            None => false,
        }
    }

    /// Deregister every socket served by tenant session `conn_id` and tell
    /// their tasks. Returns how many were orphaned.
    pub async fn orphan_session(&self, conn_id: u64) -> usize {
        let mut sockets = self.sockets.write().await;
        let ids: Vec<String> = sockets
            .iter()
            .filter(|(_, entry)| entry.conn_id == Some(conn_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = sockets.remove(id) {
                let _ = entry.tx.send(SocketCommand::Orphaned);
            }
        }
        if !ids.is_empty() {
            debug!(conn_id, count = ids.len(), "orphaned sockets of ended session");
        }
        ids.len()
    }

    async fn send(&self, socket_id: &str, command: SocketCommand) -> bool {
        match self.sockets.read().await.get(socket_id) {
            Some(entry) => entry.tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Deregister the socket. Returns the hostname it was bound to.
    pub async fn remove(&self, socket_id: &str) -> Option<String> {
        self.sockets
            .write()
            .await
            .remove(socket_id)
            .and_then(|entry| entry.hostname)
    }

    pub async fn count(&self) -> usize {
        self.sockets.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_bind_and_write() {
        let registry = SocketRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;

        assert_eq!(id.len(), 16);
        assert_eq!(registry.owner(&id).await, None);
        assert!(registry.bind_host(&id, "a.example", 1).await);
        assert_eq!(registry.owner(&id).await.as_deref(), Some("a.example"));

        assert!(registry.write(&id, b"HTTP/1.1 200 OK\r\n".to_vec()).await);
        assert_eq!(
            rx.recv().await,
            Some(SocketCommand::Write(b"HTTP/1.1 200 OK\r\n".to_vec()))
        );
    }

    #[tokio::test]
    async fn end_deregisters() {
        let registry = SocketRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;

        assert!(registry.end(&id).await);
        assert_eq!(rx.recv().await, Some(SocketCommand::End));
        assert!(!registry.contains(&id).await);
        assert!(!registry.write(&id, vec![1]).await);
        assert!(!registry.end(&id).await);
    }

    #[tokio::test]
    async fn remove_returns_bound_host() {
        let registry = SocketRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(tx).await;
        registry.bind_host(&id, "a.example", 1).await;

        assert_eq!(registry.remove(&id).await.as_deref(), Some("a.example"));
        assert_eq!(registry.remove(&id).await, None);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn orphan_session_only_touches_its_own_sockets() {
        let registry = SocketRegistry::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = registry.register(old_tx).await;
        let new = registry.register(new_tx).await;
        registry.bind_host(&old, "a.example", 1).await;
        registry.bind_host(&new, "a.example", 2).await;

        assert_eq!(registry.orphan_session(1).await, 1);
        assert_eq!(old_rx.recv().await, Some(SocketCommand::Orphaned));
        assert!(!registry.contains(&old).await);
        assert!(registry.contains(&new).await);
        assert!(new_rx.try_recv().is_err());
        assert_eq!(registry.orphan_session(1).await, 0);
    }
}

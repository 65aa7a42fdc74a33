//! Tunnel session frames exchanged between a relay client and the gateway.
//!
//! A relay client opens a WebSocket on the gateway's control path, sends
//! [`ClientFrame::Connect`] first, and from then on publishes topic-addressed
//! payloads. The gateway answers with [`ServerFrame`]s.

use serde::{Deserialize, Serialize};

/// Frames sent by a relay client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticate as `hostname`. Must be the first frame of a session.
    Connect { hostname: String, secret: String },
    /// Publish `payload` on `topic`.
    Publish {
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Keepalive.
    Ping { id: u32 },
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Result of the `Connect` attempt.
    ConnAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A payload delivered through one of the session's subscriptions.
    Message {
        topic: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// A publish was rejected. The session stays open.
    PublishError { topic: String, reason: String },
    /// Keepalive reply.
    Pong { id: u32 },
}

impl ServerFrame {
    pub fn accepted() -> Self {
        ServerFrame::ConnAck {
            ok: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        ServerFrame::ConnAck {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

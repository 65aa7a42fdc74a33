//! RPC over the `srpc` topics: per-tenant peers and the gateway bridge.

pub mod bridge;
pub mod peer;

pub use bridge::{GatewayMethods, RpcBridge, TopicTransport};
pub use peer::{RpcMethods, RpcPeer};

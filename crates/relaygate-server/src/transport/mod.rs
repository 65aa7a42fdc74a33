//! Transports for tenant sessions.

pub mod websocket;

//! Tenant side of the gateway: the live-session registry and the topic broker.

pub mod broker;
pub mod registry;

pub use broker::{Broker, Delivery};
pub use registry::{TenantHandle, TenantRegistry};

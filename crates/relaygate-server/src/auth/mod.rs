//! Authentication modules.

pub mod identity;
pub mod rate_limit;

pub use identity::{EphemeralIdentity, IdentitySettings, IdentityStore};
pub use rate_limit::RateLimiter;

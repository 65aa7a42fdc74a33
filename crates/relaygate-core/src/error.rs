use thiserror::Error;

/// Errors produced by the relaygate protocol layer.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("header parse timed out")]
    ParseTimeout,

    #[error("header parse failed: {0}")]
    ParseFailure(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("timeout")]
    Timeout,

    #[error("remote error: {message}")]
    Remote { message: String, code: Option<i64> },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Numeric code carried in an RPC error frame for this error.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GateError::Timeout => 504,
            GateError::NotFound(_) => 404,
            GateError::PermissionDenied(_) | GateError::AuthFailed(_) => 403,
            GateError::Remote { code, .. } => code.unwrap_or(501),
            _ => 500,
        }
    }

    /// Classify an error frame received from a remote peer.
    ///
    /// A 504 code means the remote side itself gave up waiting, so it is
    /// surfaced as a local timeout.
    pub fn from_remote(message: String, code: Option<i64>) -> Self {
        match code {
            Some(504) => GateError::Timeout,
            _ => GateError::Remote { message, code },
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GateError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GateError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Codec(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_gateway_timeout_code() {
        assert_eq!(GateError::Timeout.rpc_code(), 504);
        assert_eq!(GateError::NotFound("x".into()).rpc_code(), 404);
    }

    #[test]
    fn remote_504_is_a_timeout() {
        assert!(matches!(
            GateError::from_remote("slow".into(), Some(504)),
            GateError::Timeout
        ));
        assert!(matches!(
            GateError::from_remote("boom".into(), Some(500)),
            GateError::Remote { code: Some(500), .. }
        ));
    }
}

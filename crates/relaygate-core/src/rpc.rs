//! RPC frames carried over the `srpc` topics.
//!
//! Frames are JSON objects in JSON-RPC 2.0 shape. A call carries `method`
//! and `params`; a call without `id` is a notification and never answered.
//! Responses carry the call's `id` plus either `result` or `error`.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Correlation id. Peers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Num(i64),
    Str(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Num(n) => write!(f, "{n}"),
            RpcId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        RpcId::Num(n)
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl From<&GateError> for RpcErrorBody {
    fn from(e: &GateError) -> Self {
        let message = match e {
            GateError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RpcErrorBody {
            message,
            code: Some(e.rpc_code()),
        }
    }
}

/// One decoded RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    /// A call (`id` present) or notification (`id` absent).
    Call {
        id: Option<RpcId>,
        method: String,
        params: Vec<Value>,
    },
    Result {
        id: RpcId,
        result: Value,
    },
    Error {
        id: RpcId,
        error: RpcErrorBody,
    },
}

impl RpcFrame {
    pub fn call(id: RpcId, method: impl Into<String>, params: Vec<Value>) -> Self {
        RpcFrame::Call {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        RpcFrame::Call {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn id(&self) -> Option<&RpcId> {
        match self {
            RpcFrame::Call { id, .. } => id.as_ref(),
            RpcFrame::Result { id, .. } | RpcFrame::Error { id, .. } => Some(id),
        }
    }

    pub fn encode(&self) -> GateResult<Vec<u8>> {
        let value = match self {
            RpcFrame::Call { id, method, params } => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".into(), json!("2.0"));
                obj.insert("method".into(), json!(method));
                obj.insert("params".into(), Value::Array(params.clone()));
                if let Some(id) = id {
                    obj.insert("id".into(), serde_json::to_value(id)?);
                }
                Value::Object(obj)
            }
            RpcFrame::Result { id, result } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            RpcFrame::Error { id, error } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        };
        Ok(serde_json::to_vec(&value)?)
    }

    /// Decode a frame, classifying it by which keys are present.
    pub fn decode(bytes: &[u8]) -> GateResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut obj) = value else {
            return Err(GateError::InvalidMessage("rpc frame is not an object".into()));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value::<RpcId>(v).map_err(|_| {
                GateError::InvalidMessage("rpc id must be an integer or string".into())
            })?),
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(GateError::InvalidMessage("rpc method must be a string".into()));
            };
            let params = match obj.remove("params") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(params)) => params,
                Some(_) => {
                    return Err(GateError::InvalidMessage("rpc params must be an array".into()))
                }
            };
            return Ok(RpcFrame::Call { id, method, params });
        }

        let id = id.ok_or_else(|| GateError::InvalidMessage("rpc response without id".into()))?;

        if let Some(error) = obj.remove("error") {
            let error: RpcErrorBody = serde_json::from_value(error)?;
            return Ok(RpcFrame::Error { id, error });
        }
        if obj.contains_key("result") {
            let result = obj.remove("result").unwrap_or(Value::Null);
            return Ok(RpcFrame::Result { id, result });
        }

        Err(GateError::InvalidMessage(
            "rpc frame has no method, result or error".into(),
        ))
    }
}

/// The inner message of a peer envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
}

/// A tenant-to-tenant call relayed through the gateway.
///
/// Only the hostname component of `to_host` and `from_host` matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEnvelope {
    pub msg: PeerMessage,
    pub to_host: String,
    pub from_host: String,
}

impl PeerEnvelope {
    pub fn to_hostname(&self) -> GateResult<String> {
        url_hostname(&self.to_host)
    }

    pub fn from_hostname(&self) -> GateResult<String> {
        url_hostname(&self.from_host)
    }
}

fn url_hostname(raw: &str) -> GateResult<String> {
    let url = url::Url::parse(raw)
        .map_err(|e| GateError::InvalidMessage(format!("invalid host url {raw:?}: {e}")))?;
    url.host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| GateError::InvalidMessage(format!("host url {raw:?} has no hostname")))
}

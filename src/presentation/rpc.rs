//! JSON-RPC 2.0 envelope (spec.md §6.1): the wire shape every agent
//! message and gateway reply takes over the WebSocket connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes, exactly as spec.md §6 tabulates them.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub const APPROVAL_DENIED: i64 = -32001;
    pub const APPROVAL_TIMEOUT: i64 = -32002;
    pub const POLICY_DENIED: i64 = -32003;
    pub const EXECUTION_FAILED: i64 = -32004;
    pub const NOT_AUTHENTICATED: i64 = -32005;
    pub const RATE_LIMIT_EXCEEDED: i64 = -32006;
}

/// Deliberately permissive: a missing `method` or `id` must surface as
/// `INVALID_REQUEST` (spec.md §4.9), not a parse failure, so both default to
/// `Null`/empty rather than rejecting the envelope outright.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_response_omits_error_field() {
        let resp = RpcResponse::success(json!(1), json!({"ok": true}));
        let encoded = serde_json::to_value(&resp).unwrap();
        assert!(encoded.get("error").is_none());
    }

    #[test]
    fn failure_response_omits_result_field() {
        let resp = RpcResponse::failure(json!(1), error_codes::POLICY_DENIED, "denied");
        let encoded = serde_json::to_value(&resp).unwrap();
        assert!(encoded.get("result").is_none());
    }
}

//! JSON-RPC 2.0 wire types exchanged with the peer.
//!
//! Requests are built locally and only ever serialized. Responses are only
//! ever deserialized; they are never constructed by the client itself.

use serde::{Deserialize, Serialize};

/// Protocol version tag carried by every outgoing message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Create a new request with the given identifier.
    pub fn new(id: impl Into<String>, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `error` is kept as the raw JSON value so the peer's error detail can be
/// surfaced to the caller verbatim, whatever shape the peer chose for it.
/// A field that is present but `null` deserializes to `Some(Value::Null)`,
/// distinct from an absent field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcResponse {
    pub id: String,
    #[serde(default, deserialize_with = "present")]
    pub result: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present")]
    pub error: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    /// The error payload, if the peer reported a failure.
    pub fn error_detail(&self) -> Option<&serde_json::Value> {
        self.error.as_ref().filter(|e| !e.is_null())
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Structured view of a JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
#[allow(dead_code)]
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

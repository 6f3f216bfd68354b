//! Classification of incoming lines.
//!
//! The peer's output stream carries more than JSON-RPC: servers commonly print
//! log lines to stdout too. Anything that is not a response to a call we are
//! waiting on, nor a message the peer initiated, is reported as
//! [`Message::Unstructured`] and never reaches a caller.

use serde::Serialize;

use super::protocol::JsonRpcResponse;

/// A message the peer sent on its own initiative (notification or request).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerMessage {
    pub method: String,
    /// Present when the peer expects an answer.
    pub id: Option<serde_json::Value>,
    pub params: Option<serde_json::Value>,
}

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Answer to a call that is currently pending.
    Response(JsonRpcResponse),
    /// Peer-initiated message.
    Peer(PeerMessage),
    /// Diagnostic noise: unparseable, or neither shape.
    Unstructured(String),
}

/// Classify a line against the set of currently pending identifiers.
///
/// A parsed object is a `Response` only if its `id` is a string that
/// `is_pending` accepts; responses to identifiers that were never sent (or
/// were already settled) fall through to the `method` check and, failing
/// that, to `Unstructured`.
pub fn classify(line: &str, is_pending: impl Fn(&str) -> bool) -> Message {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Message::Unstructured(line.to_string()),
    };

    let Some(object) = value.as_object() else {
        return Message::Unstructured(line.to_string());
    };

    let pending_id = object
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| is_pending(id));

    if pending_id.is_some() {
        if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            return Message::Response(response);
        }
    }

    if let Some(method) = object.get("method").and_then(|m| m.as_str()) {
        return Message::Peer(PeerMessage {
            method: method.to_string(),
            id: object.get("id").cloned(),
            params: object.get("params").cloned(),
        });
    }

    Message::Unstructured(line.to_string())
}

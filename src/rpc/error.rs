//! Error taxonomy for the stdio RPC client.
//!
//! Every failed call surfaces exactly one `RpcError`. Callers that only care
//! about the broad class can use [`RpcError::is_timeout`],
//! [`RpcError::is_remote`] and [`RpcError::is_transport`].

use std::time::Duration;

use thiserror::Error;

use super::protocol::JsonRpcError;

/// Errors produced while driving the peer process.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer executable could not be launched. Fatal to the session.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer never emitted its readiness marker.
    #[error("peer did not signal readiness within {}ms", .0.as_millis())]
    ReadinessTimeout(Duration),

    /// A call was attempted before the readiness gate opened.
    #[error("peer has not signalled readiness yet")]
    NotReady,

    /// The request could not be represented on the wire.
    #[error("failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The process has exited, or termination has begun.
    #[error("cannot write: peer process has exited or is shutting down")]
    WriteAfterExit,

    /// Writing to the peer's input stream failed (broken pipe and friends).
    #[error("failed to write to peer stdin: {0}")]
    Write(#[source] std::io::Error),

    /// No response arrived within the call's deadline.
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    /// The peer answered with an error payload, kept verbatim.
    #[error("remote error: {}", describe_remote(.0))]
    Remote(serde_json::Value),

    /// A response matched a pending call but carried neither result nor error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer exited while the call was pending.
    #[error("process exited with code {}", display_code(.code))]
    ProcessExited { code: Option<i32> },

    /// The call was pending when termination began.
    #[error("call aborted: client is terminating")]
    Terminated,

    /// An identifier was registered twice. Indicates a bug, not a peer fault.
    #[error("duplicate request identifier '{0}'")]
    DuplicateIdentifier(String),

    /// The client's event loop is gone.
    #[error("rpc client is closed")]
    ClientClosed,
}

impl RpcError {
    /// True for the per-call deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::CallTimeout { .. })
    }

    /// True when the peer itself reported the failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// True for failures of the pipe or process rather than of the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Spawn { .. }
                | RpcError::WriteAfterExit
                | RpcError::Write(_)
                | RpcError::ProcessExited { .. }
                | RpcError::Terminated
                | RpcError::ClientClosed
        )
    }

    /// Typed view of a remote error payload, when it follows the JSON-RPC shape.
    pub fn remote_error(&self) -> Option<JsonRpcError> {
        match self {
            RpcError::Remote(detail) => serde_json::from_value(detail.clone()).ok(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Write(err)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Encoding(err)
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

fn describe_remote(detail: &serde_json::Value) -> String {
    match (
        detail.get("code").and_then(|c| c.as_i64()),
        detail.get("message").and_then(|m| m.as_str()),
    ) {
        (Some(code), Some(message)) => format!("[{}] {}", code, message),
        (None, Some(message)) => message.to_string(),
        _ => detail.to_string(),
    }
}

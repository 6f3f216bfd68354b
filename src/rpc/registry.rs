//! Outstanding calls keyed by request identifier.
//!
//! Each entry owns the sending half of a oneshot channel; the caller awaits
//! the receiving half. Removing the entry before sending is what guarantees
//! that an identifier is settled at most once: a second response, a late
//! response after a timeout, or a drain racing a response all find nothing to
//! settle.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::error::RpcError;
use super::protocol::JsonRpcResponse;

/// What a caller eventually receives for its call.
pub type CallOutcome = Result<serde_json::Value, RpcError>;

/// Completion handle for one pending call.
pub type Completion = oneshot::Sender<CallOutcome>;

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, Completion>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call.
    ///
    /// # Errors
    ///
    /// `RpcError::DuplicateIdentifier` if `id` is already pending. Identifiers
    /// are allocated from a monotonic counter, so this means a bug upstream.
    /// The existing entry is left untouched and `handle` is failed with the
    /// same error.
    pub fn register(&mut self, id: String, handle: Completion) -> Result<(), RpcError> {
        if self.calls.contains_key(&id) {
            error!("Identifier {} registered twice", id);
            let _ = handle.send(Err(RpcError::DuplicateIdentifier(id.clone())));
            return Err(RpcError::DuplicateIdentifier(id));
        }
        self.calls.insert(id, handle);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete a call successfully. Returns false if `id` was not pending.
    pub fn resolve(&mut self, id: &str, result: serde_json::Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Fail a call. Returns false if `id` was not pending.
    pub fn reject(&mut self, id: &str, error: RpcError) -> bool {
        self.complete(id, Err(error))
    }

    /// Settle the call a response belongs to.
    ///
    /// An error payload wins over a result; a response carrying neither is a
    /// protocol violation reported to that caller only.
    pub fn settle(&mut self, response: JsonRpcResponse) -> bool {
        if let Some(detail) = response.error_detail() {
            warn!("Peer returned an error for {}: {}", response.id, detail);
            let detail = detail.clone();
            return self.reject(&response.id, RpcError::Remote(detail));
        }
        match response.result {
            Some(result) => self.resolve(&response.id, result),
            None => self.reject(
                &response.id,
                RpcError::Protocol("response missing both result and error".to_string()),
            ),
        }
    }

    /// Forget a call without settling it (its caller stopped waiting).
    pub fn remove(&mut self, id: &str) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Reject every pending call with a fresh error from `reason` and clear
    /// the registry. Returns how many calls were rejected.
    pub fn drain_all(&mut self, reason: impl Fn() -> RpcError) -> usize {
        let count = self.calls.len();
        for (id, handle) in self.calls.drain() {
            if handle.send(Err(reason())).is_err() {
                debug!("Caller for {} stopped waiting before drain", id);
            }
        }
        count
    }

    fn complete(&mut self, id: &str, outcome: CallOutcome) -> bool {
        match self.calls.remove(id) {
            Some(handle) => {
                if handle.send(outcome).is_err() {
                    debug!("Caller for {} stopped waiting; outcome discarded", id);
                }
                true
            }
            None => {
                warn!("No pending call for {}; late or duplicate response ignored", id);
                false
            }
        }
    }
}

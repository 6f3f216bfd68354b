//! One-shot readiness gate.
//!
//! The peer announces that its transport is bound by printing a literal marker
//! (for the stock tool server: `[Server] Transport connected. Server is
//! listening.`). The gate watches raw chunks for that marker as an opaque
//! substring, tolerating a marker that straddles two reads, and latches open
//! exactly once.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::error::RpcError;

/// Marker printed by the stock tool server once it is listening.
pub const DEFAULT_READY_MARKER: &str = "[Server] Transport connected. Server is listening.";

/// Owning side of the gate, fed by the event loop.
#[derive(Debug)]
pub struct ReadinessGate {
    marker: Option<String>,
    /// Tail of the previous chunk, long enough to complete a split marker.
    carry: String,
    ready: watch::Sender<bool>,
}

impl ReadinessGate {
    /// A gate that opens when `marker` is observed. `None` opens it at once.
    pub fn new(marker: Option<&str>) -> Self {
        let marker = marker.filter(|m| !m.is_empty()).map(str::to_string);
        let (ready, _) = watch::channel(marker.is_none());
        Self {
            marker,
            carry: String::new(),
            ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// A handle that callers use to check or wait for readiness.
    pub fn subscribe(&self) -> ReadySignal {
        ReadySignal {
            rx: self.ready.subscribe(),
        }
    }

    /// Inspect one chunk. Returns true only for the chunk that opened the gate.
    pub fn observe(&mut self, chunk: &str) -> bool {
        if self.is_ready() {
            return false;
        }
        let Some(marker) = self.marker.as_deref() else {
            return false;
        };

        let mut window = std::mem::take(&mut self.carry);
        window.push_str(chunk);

        if window.contains(marker) {
            info!("Peer signalled readiness");
            self.ready.send_replace(true);
            return true;
        }

        let keep = marker.len().saturating_sub(1);
        let mut cut = window.len().saturating_sub(keep);
        while !window.is_char_boundary(cut) {
            cut += 1;
        }
        self.carry = window.split_off(cut);
        debug!("Readiness marker not seen yet");
        false
    }
}

/// Cloneable view of a [`ReadinessGate`].
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<bool>,
}

impl ReadySignal {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate opens, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// `RpcError::ReadinessTimeout` if `limit` elapses first, or
    /// `RpcError::ClientClosed` if the gate was dropped without opening.
    pub async fn wait(&mut self, limit: Duration) -> Result<(), RpcError> {
        match tokio::time::timeout(limit, self.rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RpcError::ClientClosed),
            Err(_) => Err(RpcError::ReadinessTimeout(limit)),
        }
    }
}

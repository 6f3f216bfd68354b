//! JSON-RPC client for a tool server driven over stdio.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   stdin:  requests, one per line    ┌──────────────┐
//! │   RpcClient     │ ──────────────────────────────────► │              │
//! │  (event loop)   │   stdout: responses + peer msgs     │  tool server │
//! │                 │ ◄────────────────────────────────── │   (child)    │
//! │                 │   stderr: logs + readiness marker   │              │
//! └─────────────────┘ ◄────────────────────────────────── └──────────────┘
//! ```
//!
//! A single task owns the pending-call registry, the line buffers and the
//! process state. Stream chunks, process exit, and caller commands all reach
//! it as messages, so nothing is shared and nothing is locked.
//!
//! # Usage
//!
//! ```ignore
//! use stdio_rpc::{ClientConfig, RpcClient};
//! use serde_json::json;
//!
//! let client = RpcClient::start(&ClientConfig::default()).await?;
//! let result = client
//!     .invoke("getWeather", json!({"latitude": 40.7128, "longitude": -74.006}))
//!     .await?;
//! client.terminate().await?;
//! ```

mod classify;
mod client;
mod error;
pub mod framing;
pub mod protocol;
mod readiness;
pub mod registry;

pub use classify::{classify, Message, PeerMessage};
pub use client::RpcClient;
pub use error::RpcError;
pub use framing::{encode_line, LineBuffer};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use readiness::{ReadinessGate, ReadySignal, DEFAULT_READY_MARKER};
pub use registry::PendingCalls;

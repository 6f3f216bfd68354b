//! stdio-rpc library
//!
//! Drives a tool server child process over its standard streams using
//! line-delimited JSON-RPC 2.0:
//!
//! - `rpc` - framing, message classification, call correlation, and `RpcClient`
//! - `process` - child process supervision
//! - `config` - `ClientConfig` loading
//! - `tools` - helpers for the weather / URL shortener tools
//!
//! ```ignore
//! use stdio_rpc::{ClientConfig, RpcClient};
//!
//! let client = RpcClient::start(&ClientConfig::default()).await?;
//! let weather = client
//!     .invoke("getWeather", serde_json::json!({"latitude": 40.7128, "longitude": -74.006}))
//!     .await?;
//! client.terminate().await?;
//! ```

pub mod config;
pub mod process;
pub mod rpc;
pub mod tools;

pub use config::ClientConfig;
pub use process::ProcessState;
pub use rpc::{RpcClient, RpcError};

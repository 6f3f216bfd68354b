//! Client configuration.
//!
//! Resolution order:
//!
//! 1. An explicit path passed by the caller
//! 2. `$STDIO_RPC_CONFIG`
//! 3. `<config_dir>/stdio-rpc/client.json` (XDG on Linux, Library on macOS), if present
//! 4. Built-in defaults (the stock `bun run index.ts` tool server)
//!
//! Environment overrides (`STDIO_RPC_COMMAND`, `STDIO_RPC_ARGS`,
//! `STDIO_RPC_CWD`) are applied last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rpc::DEFAULT_READY_MARKER;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "STDIO_RPC_CONFIG";
/// Environment variable overriding the peer command.
pub const COMMAND_ENV: &str = "STDIO_RPC_COMMAND";
/// Environment variable overriding the peer arguments (whitespace separated).
pub const ARGS_ENV: &str = "STDIO_RPC_ARGS";
/// Environment variable overriding the peer working directory.
pub const CWD_ENV: &str = "STDIO_RPC_CWD";

/// Which peer stream carries the readiness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStream {
    /// The peer's stderr.
    #[default]
    Diagnostic,
    /// The peer's stdout, shared with responses.
    Output,
}

/// How to launch and talk to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory for the peer; inherits ours when unset.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the peer.
    pub env: HashMap<String, String>,
    /// Literal marker announcing readiness; `None` means ready on spawn.
    pub readiness_marker: Option<String>,
    pub readiness_stream: ReadinessStream,
    pub readiness_timeout_ms: u64,
    /// Default per-call deadline; `None` waits indefinitely.
    pub call_timeout_ms: Option<u64>,
    /// How long to wait after closing stdin before killing the peer.
    pub shutdown_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: "bun".to_string(),
            args: vec!["run".to_string(), "index.ts".to_string()],
            cwd: None,
            env: HashMap::new(),
            readiness_marker: Some(DEFAULT_READY_MARKER.to_string()),
            readiness_stream: ReadinessStream::Diagnostic,
            readiness_timeout_ms: 10_000,
            call_timeout_ms: None,
            shutdown_grace_ms: 200,
        }
    }
}

impl ClientConfig {
    /// Defaults with a different command line.
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve the effective configuration (see module docs).
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| default_config_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => {
                info!("Using config file {}", path.display());
                Self::load(&path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (injected for testability).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(command) = lookup(COMMAND_ENV).filter(|c| !c.trim().is_empty()) {
            self.command = command.trim().to_string();
        }
        if let Some(args) = lookup(ARGS_ENV) {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(cwd) = lookup(CWD_ENV).filter(|c| !c.is_empty()) {
            self.cwd = Some(PathBuf::from(cwd));
        }
    }
}

/// `<config_dir>/stdio-rpc/client.json`, when a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stdio-rpc").join("client.json"))
}

//! Newline-delimited message framing for JSON-RPC over stdio.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","id":"req-1","method":"getWeather","params":{...}}\n
//! ```
//!
//! One JSON object per line. `serde_json` escapes newlines inside strings, so
//! an encoded message never contains a raw line terminator. Incoming data is
//! accumulated in a [`LineBuffer`] because a read may end anywhere, including
//! in the middle of a multi-byte UTF-8 sequence.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::error::RpcError;

/// Maximum length of a single unterminated line (16MB) before it is dropped.
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Serialize a message to a single line with exactly one trailing `\n`.
///
/// # Errors
///
/// Returns `RpcError::Encoding` if the message cannot be represented as JSON.
pub fn encode_line<T: serde::Serialize>(message: &T) -> Result<String, RpcError> {
    let mut line = serde_json::to_string(message).map_err(RpcError::Encoding)?;
    debug_assert!(!line.contains('\n'));
    line.push('\n');
    Ok(line)
}

/// Write an already-encoded line and flush it.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Accumulator for one incoming stream direction.
///
/// After every [`feed`](LineBuffer::feed) the buffer holds only bytes that
/// follow the last line terminator seen so far.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and extract every complete line, in order.
    ///
    /// Lines are trimmed (which also strips a `\r` before the `\n`); lines that
    /// are empty after trimming are discarded. Invalid UTF-8 is replaced
    /// rather than rejected, since such a line can only be noise anyway.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_LINE_SIZE {
            warn!(
                "Dropping {} buffered bytes without a line terminator (max {})",
                self.pending.len(),
                MAX_LINE_SIZE
            );
            self.pending.clear();
        }

        lines
    }

    /// Bytes received since the last complete line.
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take whatever partial line is left, e.g. once the stream hit EOF.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

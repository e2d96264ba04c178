use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex as AsyncMutex;

use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_SOFT_CAP: u64 = 500;

/// Tracks the logical byte offset consumed from the process's own stdin, so
/// that a reincarnated successor can seek a seekable stdin back to the
/// exact resume point. The offset is exactly the sum of bytes returned to
/// callers (not bytes physically read from the OS, which may run ahead
/// inside the buffered reader) — equivalent to, and simpler than, tracking
/// raw reads and subtracting the buffered remainder.
pub struct StdinShim {
    reader: AsyncMutex<BufReader<Stdin>>,
    offset: AtomicU64,
}

impl StdinShim {
    pub fn new(initial_offset: u64) -> Self {
        Self { reader: AsyncMutex::new(BufReader::new(tokio::io::stdin())), offset: AtomicU64::new(initial_offset) }
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Reads up to `max_lines` lines, racing against `deadline` if given.
    /// Returns (lines, hit_eof).
    async fn read_lines(&self, max_lines: u64, deadline: Option<Duration>) -> std::io::Result<(Vec<String>, bool)> {
        let fut = async {
            let mut reader = self.reader.lock().await;
            let mut lines = Vec::new();
            let mut eof = false;
            for _ in 0..max_lines {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    eof = true;
                    break;
                }
                self.offset.fetch_add(n as u64, Ordering::SeqCst);
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                lines.push(line);
            }
            Ok((lines, eof))
        };

        match deadline {
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(r) => r,
                Err(_) => Ok((Vec::new(), false)),
            },
            None => fut.await,
        }
    }
}

pub struct ReadTool {
    stdin: Arc<StdinShim>,
    soft_cap: u64,
}

impl ReadTool {
    pub fn new(stdin: Arc<StdinShim>) -> Self {
        Self { stdin, soft_cap: DEFAULT_SOFT_CAP }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read one or more lines from this process's own stdin."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "lines": {"type": "integer", "minimum": 0, "description": "lines to read; 0 means up to the soft cap; default 1"},
                "timeout": {"type": "integer", "description": "seconds to wait before giving up; omit for no deadline"},
            },
            "additionalProperties": false,
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let requested = match call.args.get("lines") {
            None | Some(Value::Null) => Some(1u64),
            Some(v) => match v.as_u64() {
                Some(n) => Some(n),
                None => return ToolOutput::err(&call.id, "'lines' must be a non-negative integer"),
            },
        };
        let timeout = match call.args.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => return ToolOutput::err(&call.id, "'timeout' must be an integer number of seconds"),
            },
        };

        let requested = requested.unwrap_or(1);
        let explicit_over_cap = requested > self.soft_cap;
        let to_read = if requested == 0 { self.soft_cap } else { requested.min(self.soft_cap) };

        let (lines, eof) = match self.stdin.read_lines(to_read, timeout).await {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("stdin read error: {e}")),
        };

        let hit_soft_cap_implicitly = lines.len() as u64 == to_read && !eof;
        let truncated = explicit_over_cap || hit_soft_cap_implicitly;

        let mut header = format!("[LINES READ] {}\n[EOF] {}\n", lines.len(), eof);
        if truncated {
            header.push_str("[TRUNCATED] true\n");
        }
        header.push_str("[CONTENT]\n");
        header.push_str(&lines.join("\n"));

        ToolOutput::ok(&call.id, header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── cap clamping logic (pure, no real stdin needed) ──

    #[test]
    fn explicit_value_above_cap_is_flagged() {
        let requested = 10_000u64;
        let cap = DEFAULT_SOFT_CAP;
        assert!(requested > cap);
    }

    #[test]
    fn zero_means_soft_cap() {
        let requested = 0u64;
        let cap = DEFAULT_SOFT_CAP;
        let to_read = if requested == 0 { cap } else { requested.min(cap) };
        assert_eq!(to_read, cap);
    }

    // ── shim offset accounting ──

    #[tokio::test]
    async fn offset_starts_at_configured_initial_value() {
        let shim = StdinShim::new(42);
        assert_eq!(shim.offset(), 42);
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use quine_semaphore::Semaphore;
use quine_shell::ShellCoprocess;

use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct ShTool {
    shell: Arc<ShellCoprocess>,
    semaphore: Arc<Semaphore>,
}

impl ShTool {
    pub fn new(shell: Arc<ShellCoprocess>, semaphore: Arc<Semaphore>) -> Self {
        Self { shell, semaphore }
    }
}

#[async_trait]
impl Tool for ShTool {
    fn name(&self) -> &str {
        "sh"
    }

    fn description(&self) -> &str {
        "Run a command in the persistent shell. Working directory, exported \
         variables, and shell functions carry over between calls. Write to \
         file descriptor 3 (e.g. `echo result >&3`) to deliver output to the \
         outside world; stdout (fd 1) and stderr (fd 2) are only captured \
         back into the tool result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "shell command to evaluate"},
                "timeout": {"type": "integer", "description": "per-call timeout in seconds; 0 or omitted uses the configured default"},
                "passthrough": {"type": "boolean", "description": "forward fd 1 bytes directly to the host's stdout instead of capturing them"},
            },
            "required": ["command"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing or non-string 'command' argument"),
        };
        let timeout = match call.args.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => return ToolOutput::err(&call.id, "'timeout' must be an integer number of seconds"),
            },
        };
        let passthrough = match call.args.get("passthrough") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return ToolOutput::err(&call.id, "'passthrough' must be a boolean"),
        };

        let guard = self.semaphore.acquire().await;
        let guard = match guard {
            Ok(g) => g,
            Err(e) => return ToolOutput::err(&call.id, format!("failed to acquire concurrency slot: {e}")),
        };

        let result = self.shell.execute(&command, timeout, passthrough).await;
        drop(guard);

        match result {
            Ok(r) => {
                let stdout_section = if r.stdout_passed_through {
                    "(passthrough)".to_string()
                } else {
                    String::from_utf8_lossy(&r.stdout).into_owned()
                };
                let stderr_section = String::from_utf8_lossy(&r.stderr).into_owned();
                if r.timed_out {
                    return ToolOutput::err(&call.id, "[EXIT CODE] -1\n[TIMEOUT] shell call exceeded its deadline; coprocess recycled");
                }
                let content = format!("[EXIT CODE] {}\n[STDOUT]\n{}\n[STDERR]\n{}", r.exit_code, stdout_section, stderr_section);
                ToolOutput { call_id: call.id.clone(), content, is_error: r.exit_code != 0 }
            }
            Err(e) => ToolOutput::err(&call.id, format!("shell coprocess error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_tool() -> ShTool {
        let dir = tempdir().unwrap();
        let host_stdout_fd = unsafe { libc::dup(1) };
        let shell = ShellCoprocess::spawn("/bin/sh", dir.path(), Duration::from_secs(5), 20_000, host_stdout_fd).await.unwrap();
        let sem = Semaphore::new(dir.path().join("locks"), "s1", 4);
        ShTool::new(Arc::new(shell), Arc::new(sem))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "sh".into(), args }
    }

    // ── argument validation ──

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let t = make_tool().await;
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn non_integer_timeout_is_an_error() {
        let t = make_tool().await;
        let out = t.execute(&call(json!({"command": "true", "timeout": "soon"}))).await;
        assert!(out.is_error);
    }

    // ── happy path ──

    #[tokio::test]
    async fn zero_exit_is_not_an_error() {
        let t = make_tool().await;
        let out = t.execute(&call(json!({"command": "true"}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("[EXIT CODE] 0"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let t = make_tool().await;
        let out = t.execute(&call(json!({"command": "false"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("[EXIT CODE] 1"));
    }
}

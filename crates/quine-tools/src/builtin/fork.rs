use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Everything `fork` needs to know about its own process to spawn a proper
/// child: the binary to re-exec, the current session's identity, and where
/// the data directory / current tape live.
pub struct ForkContext {
    pub binary: PathBuf,
    pub session_id: String,
    pub depth: u32,
    pub max_depth: u32,
    pub data_dir: PathBuf,
    pub tape_path: PathBuf,
    pub default_wait_timeout: Duration,
}

pub struct ForkTool {
    ctx: ForkContext,
}

impl ForkTool {
    pub fn new(ctx: ForkContext) -> Self {
        Self { ctx }
    }

    fn child_env(&self, context_tape: &Path) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars().filter(|(k, _)| k != "QUINE_SESSION_ID").collect();
        env.retain(|(k, _)| k != "QUINE_DEPTH" && k != "QUINE_PARENT_SESSION" && k != "QUINE_CONTEXT_TAPE");
        env.push(("QUINE_DEPTH".to_string(), (self.ctx.depth + 1).to_string()));
        env.push(("QUINE_PARENT_SESSION".to_string(), self.ctx.session_id.clone()));
        env.push(("QUINE_CONTEXT_TAPE".to_string(), context_tape.display().to_string()));
        env
    }
}

#[async_trait]
impl Tool for ForkTool {
    fn name(&self) -> &str {
        "fork"
    }

    fn description(&self) -> &str {
        "Spawn a new instance of this same binary as a child process, with \
         a copy of the current conversation as its bootstrap context. Use \
         this to delegate a sub-task; `wait=true` blocks for its result, \
         `wait=false` detaches and returns immediately."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "intent": {"type": "string", "description": "the child's mission"},
                "wait": {"type": "boolean", "description": "block until the child exits (default false)"},
            },
            "required": ["intent"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let intent = match call.args.get("intent").and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => s.to_string(),
            Some(_) => return ToolOutput::err(&call.id, "'intent' must be a non-empty string"),
            None => return ToolOutput::err(&call.id, "missing or non-string 'intent' argument"),
        };
        let wait = match call.args.get("wait") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return ToolOutput::err(&call.id, "'wait' must be a boolean"),
        };

        if self.ctx.depth >= self.ctx.max_depth {
            return ToolOutput::err(&call.id, format!("fork refused: at max depth ({})", self.ctx.max_depth));
        }

        let context_tape = self.ctx.data_dir.join(format!("fork-{}.jsonl", Uuid::new_v4()));
        if let Err(e) = std::fs::copy(&self.ctx.tape_path, &context_tape) {
            return ToolOutput::err(&call.id, format!("failed to snapshot context tape: {e}"));
        }

        let env = self.child_env(&context_tape);
        let mut cmd = tokio::process::Command::new(&self.ctx.binary);
        cmd.arg(&intent).env_clear().envs(env).stdin(Stdio::inherit()).kill_on_drop(false);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        if wait {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            let child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => return ToolOutput::err(&call.id, format!("failed to spawn child: {e}")),
            };
            let pid = child.id();
            let result = tokio::time::timeout(self.ctx.default_wait_timeout, child.wait_with_output()).await;
            let _ = std::fs::remove_file(&context_tape);
            match result {
                Ok(Ok(output)) => {
                    let content = format!(
                        "[EXIT CODE] {}\n[STDOUT]\n{}\n[STDERR]\n{}",
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stdout),
                        String::from_utf8_lossy(&output.stderr),
                    );
                    ToolOutput { call_id: call.id.clone(), content, is_error: !output.status.success() }
                }
                Ok(Err(e)) => ToolOutput::err(&call.id, format!("child wait error: {e}")),
                Err(_) => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
                    }
                    ToolOutput::err(&call.id, "[EXIT CODE] -1\n[TIMEOUT] forked child exceeded the default timeout; process group killed")
                }
            }
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    let _ = std::fs::remove_file(&context_tape);
                    return ToolOutput::err(&call.id, format!("failed to spawn child: {e}"));
                }
            };
            let pid = child.id().unwrap_or(0);
            let data_dir = self.ctx.data_dir.clone();
            let sweep_path = context_tape.clone();
            tokio::spawn(async move {
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "forked child wait failed");
                }
                let _ = std::fs::remove_file(&sweep_path);
            });
            ToolOutput::ok(&call.id, format!("[PID] {pid}\n[DATA DIR] {}", data_dir.display()))
        }
    }
}

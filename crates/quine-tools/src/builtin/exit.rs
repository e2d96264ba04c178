use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn os_exit_code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub status: ExitStatus,
    pub stderr: Option<String>,
}

/// The turn loop polls this after dispatching each round's tool calls to
/// find out whether `exit` was invoked and, if so, with what verdict.
#[derive(Default)]
pub struct ExitSignal(Mutex<Option<ExitDecision>>);

impl ExitSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }

    pub fn set(&self, decision: ExitDecision) {
        *self.0.lock().unwrap() = Some(decision);
    }

    pub fn take(&self) -> Option<ExitDecision> {
        self.0.lock().unwrap().take()
    }
}

pub struct ExitTool {
    signal: Arc<ExitSignal>,
}

impl ExitTool {
    pub fn new(signal: Arc<ExitSignal>) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl Tool for ExitTool {
    fn name(&self) -> &str {
        "exit"
    }

    fn description(&self) -> &str {
        "Declare the task finished and terminate at the end of this turn. \
         `status=failure` exits with code 1; include `stderr` to explain why."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["success", "failure"]},
                "stderr": {"type": "string", "description": "forwarded to the host's stderr verbatim"},
            },
            "required": ["status"],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let status = match call.args.get("status").and_then(|v| v.as_str()) {
            Some("success") => ExitStatus::Success,
            Some("failure") => ExitStatus::Failure,
            Some(other) => return ToolOutput::err(&call.id, format!("'status' must be 'success' or 'failure', got '{other}'")),
            None => return ToolOutput::err(&call.id, "missing 'status' argument"),
        };
        let stderr = match call.args.get("stderr") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return ToolOutput::err(&call.id, "'stderr' must be a string"),
        };

        self.signal.set(ExitDecision { status, stderr });
        ToolOutput::ok(&call.id, format!("exit recorded: {status:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "exit".into(), args }
    }

    #[tokio::test]
    async fn records_success_decision() {
        let signal = ExitSignal::new();
        let tool = ExitTool::new(signal.clone());
        tool.execute(&call(json!({"status": "success"}))).await;
        let decision = signal.take().unwrap();
        assert_eq!(decision.status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn forwards_stderr_text() {
        let signal = ExitSignal::new();
        let tool = ExitTool::new(signal.clone());
        tool.execute(&call(json!({"status": "failure", "stderr": "E_TEST"}))).await;
        let decision = signal.take().unwrap();
        assert_eq!(decision.stderr.as_deref(), Some("E_TEST"));
    }

    #[tokio::test]
    async fn invalid_status_is_an_error_and_records_nothing() {
        let signal = ExitSignal::new();
        let tool = ExitTool::new(signal.clone());
        let out = tool.execute(&call(json!({"status": "maybe"}))).await;
        assert!(out.is_error);
        assert!(signal.take().is_none());
    }

    #[test]
    fn success_maps_to_exit_code_zero_failure_to_one() {
        assert_eq!(ExitStatus::Success.os_exit_code(), 0);
        assert_eq!(ExitStatus::Failure.os_exit_code(), 1);
    }
}

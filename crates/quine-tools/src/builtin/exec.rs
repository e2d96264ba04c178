use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Performs the actual OS process-image replacement. Implemented in
/// `quine-core` (which owns the environment/wisdom/tape bookkeeping); this
/// crate only needs the capability, injected as a trait object, to avoid a
/// dependency cycle. On success this call never returns to the caller — the
/// process image is gone. The only value it can ever hand back is the
/// `io::Error` from a *failed* replacement attempt.
pub trait Reincarnator: Send + Sync {
    fn reincarnate(&self, persona: Option<&str>, reason: Option<&str>) -> io::Error;
}

pub struct ExecTool {
    reincarnator: Arc<dyn Reincarnator>,
}

impl ExecTool {
    pub fn new(reincarnator: Arc<dyn Reincarnator>) -> Self {
        Self { reincarnator }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Replace this process's image with a fresh instance of itself, \
         carrying the original mission and any recorded wisdom forward. \
         Use this to recover from a degraded context rather than accumulate \
         more history."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "persona": {"type": "string", "description": "optional persona hint for the successor"},
                "reason": {"type": "string", "description": "why reincarnation is being requested"},
            },
            "additionalProperties": false,
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let persona = match call.args.get("persona") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return ToolOutput::err(&call.id, "'persona' must be a string"),
        };
        let reason = match call.args.get("reason") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return ToolOutput::err(&call.id, "'reason' must be a string"),
        };

        let err = self.reincarnator.reincarnate(persona.as_deref(), reason.as_deref());
        ToolOutput::err(&call.id, format!("reincarnation failed: {err}"))
    }
}

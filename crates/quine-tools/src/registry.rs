use std::collections::HashMap;
use std::sync::Arc;

use quine_model::ToolSchema;
use tracing::instrument;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Exactly five tools are advertised per spec: `sh`, `read`, `fork`, `exec`,
/// `exit`. The registry itself is generic over any `Tool` impl so tests can
/// register doubles.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| {
                let t = &self.tools[n];
                ToolSchema { name: t.name().to_string(), description: t.description().to_string(), parameters: t.parameters_schema() }
            })
            .collect()
    }

    #[instrument(skip(self, call), fields(tool = %call.name, call_id = %call.id))]
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.to_string())
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall { id: "t1".into(), name: name.into(), args: json!({}) }
    }

    #[tokio::test]
    async fn dispatches_to_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        let out = reg.execute(&call("echo")).await;
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result_not_a_panic() {
        let reg = ToolRegistry::new();
        let out = reg.execute(&call("nope")).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "echo");
    }
}

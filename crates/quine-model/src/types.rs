use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use quine_tape::{Message, Role, ToolInvocation};

/// A tool schema advertised to the provider: name, description, and a JSON
/// Schema object describing its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

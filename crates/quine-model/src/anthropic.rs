use serde_json::{json, Value};

use crate::adapter::{looks_like_context_overflow, Adapter};
use crate::error::ProviderError;
use crate::types::{Message, Role, ToolInvocation, ToolSchema, Usage};

pub struct AnthropicAdapter;

/// `A_anth`: all system-role messages are concatenated with `"\n\n"` into
/// the top-level `system` field; user messages carry a raw string body;
/// assistant messages carry an ordered list of typed blocks; tool_result
/// messages become a user message with a single `tool_result` block.
impl Adapter for AnthropicAdapter {
    fn endpoint_path(&self) -> &'static str {
        "/v1/messages"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, messages: &[Message], tools: &[ToolSchema], model: &str, max_out_tokens: u32) -> Vec<u8> {
        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let wire_messages: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(encode_message)
            .collect();

        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": max_out_tokens,
            "messages": wire_messages,
            "stream": false,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !wire_tools.is_empty() {
            body["tools"] = json!(wire_tools);
        }
        serde_json::to_vec(&body).expect("anthropic request body always serializes")
    }

    fn decode(&self, body: &[u8]) -> Result<(Message, Usage), ProviderError> {
        let v: Value = serde_json::from_slice(body)?;
        let blocks = v.get("content").and_then(|c| c.as_array()).cloned().unwrap_or_default();

        let mut text = String::new();
        let mut invocations = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                    let arguments = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    invocations.push(ToolInvocation { id, name, arguments });
                }
                _ => {}
            }
        }

        let usage = Usage {
            input_tokens: v.pointer("/usage/input_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
            output_tokens: v.pointer("/usage/output_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
        };

        Ok((Message::assistant(text, invocations), usage))
    }

    fn classify_error(&self, status: u16, body: &[u8]) -> ProviderError {
        if status == 401 || status == 403 {
            return ProviderError::Auth(String::from_utf8_lossy(body).into_owned());
        }
        let text = String::from_utf8_lossy(body).into_owned();
        let v: Option<Value> = serde_json::from_slice(body).ok();
        let message = v
            .as_ref()
            .and_then(|v| v.pointer("/error/message"))
            .and_then(|m| m.as_str())
            .unwrap_or(&text)
            .to_string();
        let kind = v.as_ref().and_then(|v| v.pointer("/error/type")).and_then(|t| t.as_str()).unwrap_or("");
        if looks_like_context_overflow(&message) || kind == "overloaded_error" {
            return ProviderError::ContextOverflow(message);
        }
        ProviderError::Http { status, body: text }
    }
}

fn encode_message(m: &Message) -> Value {
    match m.role {
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Assistant => {
            let mut blocks = Vec::new();
            if !m.content.is_empty() {
                blocks.push(json!({"type": "text", "text": m.content}));
            }
            for tc in m.tool_calls.iter().flatten() {
                blocks.push(json!({"type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments}));
            }
            if blocks.is_empty() {
                blocks.push(json!({"type": "text", "text": ""}));
            }
            json!({"role": "assistant", "content": blocks})
        }
        Role::ToolResult => {
            let tool_use_id = m.tool_id.clone().unwrap_or_default();
            json!({
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": tool_use_id, "content": m.content}],
            })
        }
        Role::System => unreachable!("system messages are filtered out before encode_message"),
    }
}

use serde_json::{json, Value};

use crate::adapter::{looks_like_context_overflow, Adapter};
use crate::error::ProviderError;
use crate::types::{Message, Role, ToolInvocation, ToolSchema, Usage};

pub struct OpenAiAdapter;

/// `A_oai`: system, user, and assistant messages map one-to-one; assistant
/// tool invocations become a `tool_calls` list with stringified-JSON
/// arguments; tool_result messages become role `tool`.
impl Adapter for OpenAiAdapter {
    fn endpoint_path(&self) -> &'static str {
        "/v1/chat/completions"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, messages: &[Message], tools: &[ToolSchema], model: &str, max_out_tokens: u32) -> Vec<u8> {
        let wire_messages: Vec<Value> = messages.iter().map(encode_message).collect();
        let wire_tools: Vec<Value> = tools
            .iter()
            .map(|t| json!({"type": "function", "function": {"name": t.name, "description": t.description, "parameters": t.parameters}}))
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": max_out_tokens,
            "messages": wire_messages,
            "stream": false,
        });
        if !wire_tools.is_empty() {
            body["tools"] = json!(wire_tools);
        }
        serde_json::to_vec(&body).expect("openai request body always serializes")
    }

    fn decode(&self, body: &[u8]) -> Result<(Message, Usage), ProviderError> {
        let v: Value = serde_json::from_slice(body)?;
        let message = v.pointer("/choices/0/message").cloned().unwrap_or_else(|| json!({}));

        let text = message.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();

        let mut invocations = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string();
                let name = call.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                let arguments_str = call.pointer("/function/arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                let arguments = serde_json::from_str(arguments_str).unwrap_or_else(|_| json!({}));
                invocations.push(ToolInvocation { id, name, arguments });
            }
        }

        let usage = Usage {
            input_tokens: v.pointer("/usage/prompt_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
            output_tokens: v.pointer("/usage/completion_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
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
        let code = v.as_ref().and_then(|v| v.pointer("/error/code")).and_then(|c| c.as_str()).unwrap_or("");
        if looks_like_context_overflow(&message) || code == "context_length_exceeded" {
            return ProviderError::ContextOverflow(message);
        }
        ProviderError::Http { status, body: text }
    }
}

fn encode_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.content}),
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Assistant => {
            let mut out = json!({"role": "assistant", "content": m.content});
            if let Some(calls) = &m.tool_calls {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments).unwrap_or_else(|_| "{}".into()),
                            },
                        })
                    })
                    .collect();
                out["tool_calls"] = json!(tool_calls);
            }
            out
        }
        Role::ToolResult => {
            json!({"role": "tool", "tool_call_id": m.tool_id.clone().unwrap_or_default(), "content": m.content})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<ToolSchema> {
        vec![ToolSchema { name: "sh".into(), description: "run a shell command".into(), parameters: json!({"type":"object"}) }]
    }

    // ── encode ──

    #[test]
    fn system_user_assistant_map_one_to_one() {
        let messages = vec![Message::system("sys1"), Message::system("sys2"), Message::user("hi")];
        let body = OpenAiAdapter.encode(&messages, &[], "gpt", 1024);
        let v: Value = serde_json::from_slice(&body).unwrap();
        let wire = v["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "system");
    }

    #[test]
    fn assistant_tool_calls_stringify_arguments() {
        let calls = vec![ToolInvocation { id: "tc1".into(), name: "sh".into(), arguments: json!({"command":"ls"}) }];
        let messages = vec![Message::assistant("", calls)];
        let body = OpenAiAdapter.encode(&messages, &tools(), "gpt", 1024);
        let v: Value = serde_json::from_slice(&body).unwrap();
        let args = v["messages"][0]["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert_eq!(args, "{\"command\":\"ls\"}");
    }

    #[test]
    fn tool_result_becomes_role_tool() {
        let messages = vec![Message::tool_result("tc1", "output")];
        let body = OpenAiAdapter.encode(&messages, &[], "gpt", 1024);
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["messages"][0]["role"], "tool");
        assert_eq!(v["messages"][0]["tool_call_id"], "tc1");
    }

    // ── decode ──

    #[test]
    fn decode_parses_tool_call_arguments_json_string() {
        let body = json!({
            "choices": [{"message": {"content": "", "tool_calls": [
                {"id": "tc1", "function": {"name": "sh", "arguments": "{\"command\":\"ls\"}"}},
            ]}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2},
        });
        let (msg, usage) = OpenAiAdapter.decode(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(msg.tool_calls.unwrap()[0].arguments, json!({"command": "ls"}));
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 2);
    }

    // ── error classification ──

    #[test]
    fn classifies_403_as_auth() {
        assert!(OpenAiAdapter.classify_error(403, b"forbidden").is_auth());
    }

    #[test]
    fn classifies_context_length_exceeded_code() {
        let body = json!({"error": {"message": "too long", "code": "context_length_exceeded"}});
        assert!(OpenAiAdapter.classify_error(400, &serde_json::to_vec(&body).unwrap()).is_context_overflow());
    }
}

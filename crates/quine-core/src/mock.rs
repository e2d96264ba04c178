//! A scripted, network-free `ModelClient` for tests and for exercising the
//! CLI without live credentials. Each call to `generate` pops the next
//! response off the front of a queue.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use quine_model::{Message, ModelClient, ProviderError, ToolInvocation, ToolSchema, Usage};
use serde_json::Value;

/// Replays a fixed sequence of assistant turns. Once the queue is empty,
/// further calls return an idle text reply with no tool invocations — this
/// lets a test end a scripted conversation with an explicit `exit` call
/// rather than having to account for every possible extra turn.
pub struct MockProvider {
    script: StdMutex<Vec<(Message, Usage)>>,
    context_window: u32,
}

impl MockProvider {
    pub fn new(script: Vec<(Message, Usage)>) -> Self {
        Self { script: StdMutex::new(script), context_window: 200_000 }
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    /// A provider that always replies with the given text and no tool calls.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(vec![(Message::assistant(text, vec![]), Usage { input_tokens: 5, output_tokens: 5 })])
    }

    /// A provider that calls one tool, then replies with `final_text` after
    /// seeing the tool's result appended to the tape.
    pub fn tool_then_text(tool_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value, final_text: impl Into<String>) -> Self {
        let invocation = ToolInvocation { id: tool_id.into(), name: tool_name.into(), arguments };
        Self::new(vec![
            (Message::assistant("", vec![invocation]), Usage { input_tokens: 5, output_tokens: 5 }),
            (Message::assistant(final_text, vec![]), Usage { input_tokens: 5, output_tokens: 5 }),
        ])
    }

    /// A provider whose every call fails, useful for exercising the error
    /// and context-overflow termination paths without a live endpoint.
    pub fn failing(error: ProviderError) -> FailingProvider {
        FailingProvider(error)
    }
}

#[async_trait]
impl ModelClient for MockProvider {
    async fn generate(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Ok((Message::assistant("", vec![]), Usage::default()));
        }
        Ok(script.remove(0))
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }
}

/// Always returns the same error; constructed via [`MockProvider::failing`].
pub struct FailingProvider(ProviderError);

#[async_trait]
impl ModelClient for FailingProvider {
    async fn generate(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
        Err(clone_provider_error(&self.0))
    }

    fn context_window(&self) -> u32 {
        0
    }
}

fn clone_provider_error(e: &ProviderError) -> ProviderError {
    match e {
        ProviderError::Auth(s) => ProviderError::Auth(s.clone()),
        ProviderError::ContextOverflow(s) => ProviderError::ContextOverflow(s.clone()),
        ProviderError::Http { status, body } => ProviderError::Http { status: *status, body: body.clone() },
        ProviderError::Network(_) | ProviderError::Decode(_) => ProviderError::Http { status: 0, body: e.to_string() },
    }
}

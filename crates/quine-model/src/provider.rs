use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use tracing::warn;

use crate::adapter::Adapter;
use crate::anthropic::AnthropicAdapter;
use crate::error::ProviderError;
use crate::openai::OpenAiAdapter;
use crate::types::{Message, ToolSchema, Usage};

/// What the turn loop needs from a model backend: generate the next
/// assistant message, and report the context window it was built against.
/// `Provider` is the only production implementation; tests substitute a
/// canned-response double (see `quine_core::mock`) so the loop's control
/// flow can be exercised without live credentials.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError>;
    fn context_window(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

const DEFAULT_CONTEXT_WINDOW_ANTHROPIC: u32 = 200_000;
const DEFAULT_CONTEXT_WINDOW_OPENAI: u32 = 128_000;

/// Composes one adapter + one signed transport. Retries live here, not in
/// the adapter: the adapter only knows how to encode/decode/classify, never
/// how many times to try.
pub struct Provider {
    kind: ProviderKind,
    adapter: Box<dyn Adapter>,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_out_tokens: u32,
    context_window: u32,
}

impl Provider {
    pub fn new(kind: ProviderKind, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, max_out_tokens: u32, context_window: Option<u32>) -> Self {
        let adapter: Box<dyn Adapter> = match kind {
            ProviderKind::Anthropic => Box::new(AnthropicAdapter),
            ProviderKind::OpenAi => Box::new(OpenAiAdapter),
        };
        let default_window = match kind {
            ProviderKind::Anthropic => DEFAULT_CONTEXT_WINDOW_ANTHROPIC,
            ProviderKind::OpenAi => DEFAULT_CONTEXT_WINDOW_OPENAI,
        };
        Self {
            kind,
            adapter,
            client: Client::new(),
            api_key: api_key.into(),
            base_url: trim_trailing_slash(&base_url.into()),
            model: model.into(),
            max_out_tokens,
            context_window: context_window.filter(|w| *w > 0).unwrap_or(default_window),
        }
    }

    pub fn context_window(&self) -> u32 {
        self.context_window
    }

    fn endpoint_url(&self) -> String {
        let path = self.adapter.endpoint_path();
        // Elide a duplicated `/v1` when the configured base already carries it.
        if self.base_url.ends_with("/v1") && path.starts_with("/v1/") {
            format!("{}{}", self.base_url, &path[3..])
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn sign(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.kind {
            ProviderKind::Anthropic => builder.header("x-api-key", &self.api_key).header("anthropic-version", "2023-06-01"),
            ProviderKind::OpenAi => builder.header("Authorization", format!("Bearer {}", self.api_key)),
        }
    }

    pub async fn generate(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
        let body = self.adapter.encode(messages, tools, &self.model, self.max_out_tokens);
        let url = self.endpoint_url();

        let mut network_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;
        let mut server_error_attempts = 0u32;
        let mut unexpected_attempts = 0u32;

        loop {
            let req = self
                .sign(self.client.post(&url).header("Content-Type", self.adapter.content_type()))
                .body(body.clone());

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if network_attempts < 3 {
                        network_attempts += 1;
                        warn!(attempt = network_attempts, error = %e, "network error calling provider, retrying");
                        backoff(network_attempts).await;
                        continue;
                    }
                    return Err(ProviderError::Network(e));
                }
            };

            let status = resp.status();
            if status.is_success() {
                let bytes = resp.bytes().await?;
                return self.adapter.decode(&bytes);
            }

            let code = status.as_u16();
            if code == 401 || code == 403 {
                let bytes = resp.bytes().await.unwrap_or_default();
                return Err(self.adapter.classify_error(code, &bytes));
            }

            if code == 429 {
                if rate_limit_attempts < 5 {
                    rate_limit_attempts += 1;
                    let _ = resp.bytes().await;
                    warn!(attempt = rate_limit_attempts, "rate limited by provider, retrying");
                    backoff(rate_limit_attempts).await;
                    continue;
                }
                let bytes = resp.bytes().await.unwrap_or_default();
                return Err(self.adapter.classify_error(code, &bytes));
            }

            if status.is_server_error() {
                if server_error_attempts < 3 {
                    server_error_attempts += 1;
                    let _ = resp.bytes().await;
                    warn!(attempt = server_error_attempts, status = code, "server error from provider, retrying");
                    backoff(server_error_attempts).await;
                    continue;
                }
                let bytes = resp.bytes().await.unwrap_or_default();
                return Err(self.adapter.classify_error(code, &bytes));
            }

            // Unexpected status: one retry, then classify as-is.
            if unexpected_attempts < 1 {
                unexpected_attempts += 1;
                let _ = resp.bytes().await;
                backoff(unexpected_attempts).await;
                continue;
            }
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(self.adapter.classify_error(code, &bytes));
        }
    }
}

/// `500ms * 2^attempt` base, with uniform jitter in `[0, base/2)`.
async fn backoff(attempt: u32) {
    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..(base_ms / 2).max(1));
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

fn trim_trailing_slash(s: &str) -> String {
    s.trim_end_matches('/').to_string()
}

#[async_trait]
impl ModelClient for Provider {
    async fn generate(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
        Provider::generate(self, messages, tools).await
    }

    fn context_window(&self) -> u32 {
        Provider::context_window(self)
    }
}

use crate::error::ProviderError;
use crate::types::{Message, ToolSchema, Usage};

/// Converts tape messages and tool schemas into a provider-specific wire
/// request, and decodes a provider-specific wire response back into a tape
/// message. The provider composes one `Adapter` + one transport/signer; no
/// inheritance, just a shared capability set (a "tagged
/// variants" note).
pub trait Adapter: Send + Sync {
    fn endpoint_path(&self) -> &'static str;
    fn content_type(&self) -> &'static str;
    fn encode(&self, messages: &[Message], tools: &[ToolSchema], model: &str, max_out_tokens: u32) -> Vec<u8>;
    fn decode(&self, body: &[u8]) -> Result<(Message, Usage), ProviderError>;
    fn classify_error(&self, status: u16, body: &[u8]) -> ProviderError;
}

/// Common phrase-sniffing for provider error envelopes: both Anthropic and
/// OpenAI signal context-window overflow and overload conditions through
/// free-text `message`/`type`/`code` fields rather than a dedicated status
/// code, so both adapters classify the same way once the envelope is
/// reduced to a lowercase string.
pub(crate) fn looks_like_context_overflow(haystack: &str) -> bool {
    let h = haystack.to_ascii_lowercase();
    h.contains("context_length")
        || h.contains("context length")
        || h.contains("maximum context")
        || h.contains("too many tokens")
        || h.contains("overloaded")
        || h.contains("exceeds the model")
        || h.contains("prompt is too long")
}

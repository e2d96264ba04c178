//! Protocol adapters (§4.C) and the retrying signed-transport provider
//! (§4.D). Two adapters only: Anthropic and OpenAI, selected purely by
//! configured provider kind — no heuristics on the model string.

pub mod adapter;
pub mod anthropic;
pub mod error;
pub mod openai;
pub mod provider;
pub mod types;

pub use adapter::Adapter;
pub use anthropic::AnthropicAdapter;
pub use error::ProviderError;
pub use openai::OpenAiAdapter;
pub use provider::{ModelClient, Provider, ProviderKind};
pub use types::{Message, Role, ToolInvocation, ToolSchema, Usage};

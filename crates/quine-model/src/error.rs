use thiserror::Error;

/// The five error kinds the turn loop needs to branch on (this module's
/// kinds 1–3; kinds 4/5/6 are handled outside this crate).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("context overflow: {0}")]
    ContextOverflow(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProviderError {
    /// Auth errors and context-overflow are the two the turn loop must
    /// recognize by kind rather than by opaque status; everything else is
    /// "a generic, opaque error carrying the status code and raw body".
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }

    pub fn is_context_overflow(&self) -> bool {
        matches!(self, ProviderError::ContextOverflow(_))
    }
}

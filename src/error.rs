use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
}

impl LLMError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            LLMError::Status { status, .. } => *status == 429 || *status >= 500,
            LLMError::Timeout(_) => true,
            LLMError::Serialization(_)
            | LLMError::Provider(_)
            | LLMError::InvalidResponse(_)
            | LLMError::Unsupported(_) => false,
        }
    }
}

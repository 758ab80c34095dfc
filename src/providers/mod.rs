use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod openai;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    /// Model identifiers currently served by the backend.
    async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        Err(LLMError::Unsupported("model listing"))
    }

    fn name(&self) -> &'static str;
}

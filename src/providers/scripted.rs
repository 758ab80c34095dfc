use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Replays canned grader replies in order. Useful for dry runs and tests.
///
/// Each request is recorded so callers can inspect the prompts that were sent.
pub struct ScriptedProvider {
    models: Vec<String>,
    responses: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models,
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.push(Ok(response.into()));
        self
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()));
        self
    }

    /// Reply used once the scripted queue is exhausted.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn push(&self, entry: Result<String, String>) {
        if let Ok(mut guard) = self.responses.lock() {
            guard.push_back(entry);
        }
    }

    fn next_response(&self) -> Option<Result<String, String>> {
        let next = self.responses.lock().ok()?.pop_front();
        next.or_else(|| self.fallback.clone().map(Ok))
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request);
        }

        match self.next_response() {
            Some(Ok(response)) => Ok(CompletionResponse {
                message: ChatMessage::assistant(response),
                usage: None,
            }),
            Some(Err(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        Ok(self.models.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

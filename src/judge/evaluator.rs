use std::{sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    config::GraderConfig,
    eval::scenario::Scenario,
    history::ConversationHistory,
    judge::{
        aggregate::{aggregate, ConversationEvaluation, QualityGate},
        criteria::{CriterionSpec, Rubric},
        parse::{parse_criterion_reply, parse_turn_grade, CriterionResult, ParseError},
        prompt::{criterion_prompt, flow_prompt, turn_prompt, SYSTEM_PROMPT},
    },
    retry::RetryPolicy,
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("grading backend unavailable: {0}")]
    BackendUnavailable(#[source] LLMError),
    #[error("grading model `{model}` is not loaded (available: {available:?})")]
    ModelMissing { model: String, available: Vec<String> },
    #[error("grading call failed: {0}")]
    Provider(#[from] LLMError),
    #[error("unreadable grader reply: {0}")]
    Parse(#[from] ParseError),
    #[error("prompt rendering failed: {0}")]
    Prompt(#[from] handlebars::RenderError),
    #[error("grader reply had no content")]
    EmptyReply,
}

/// Asks an LLM to grade a recorded conversation, one criterion per request.
pub struct CriterionEvaluator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    flow_max_tokens: u32,
    request_timeout: Duration,
    retry: RetryPolicy,
    rubric: Rubric,
}

impl CriterionEvaluator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        let defaults = GraderConfig::default();
        Self {
            provider,
            model: model.into(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            flow_max_tokens: defaults.flow_max_tokens,
            request_timeout: defaults.request_timeout(),
            retry: RetryPolicy::default(),
            rubric: Rubric::standard(),
        }
    }

    pub fn from_config(provider: Arc<dyn LLMProvider>, config: &GraderConfig, retry: RetryPolicy) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            flow_max_tokens: config.flow_max_tokens,
            request_timeout: config.request_timeout(),
            retry,
            rubric: Rubric::standard(),
        }
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Confirms the backend answers and serves the configured model.
    pub async fn check_backend(&self) -> Result<(), EvaluationError> {
        let available = self
            .provider
            .list_models()
            .await
            .map_err(EvaluationError::BackendUnavailable)?;

        if available.iter().any(|model| model == &self.model) {
            Ok(())
        } else {
            Err(EvaluationError::ModelMissing {
                model: self.model.clone(),
                available,
            })
        }
    }

    async fn complete(&self, prompt: String, max_tokens: u32) -> Result<String, EvaluationError> {
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(max_tokens);

        let limit_ms = self.request_timeout.as_millis() as u64;
        let response = self
            .retry
            .run("grader completion", LLMError::is_transient, || {
                let request = request.clone();
                async move {
                    match timeout(self.request_timeout, self.provider.complete(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(LLMError::Timeout(limit_ms)),
                    }
                }
            })
            .await?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(EvaluationError::EmptyReply),
        }
    }

    /// Grades one criterion. Never fails: problems become a zero-score critical result.
    pub async fn evaluate_criterion(
        &self,
        spec: &CriterionSpec,
        scenario: &Scenario,
        history: &ConversationHistory,
    ) -> CriterionResult {
        let prompt = match criterion_prompt(
            spec,
            &scenario.summary(),
            &scenario.expected_behaviors,
            history,
        ) {
            Ok(prompt) => prompt,
            Err(err) => return CriterionResult::failure(spec, format!("prompt rendering failed: {err}")),
        };

        let reply = match self.complete(prompt, self.max_tokens).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(criterion = %spec.id, error = %err, "criterion grading failed");
                return CriterionResult::failure(spec, err.to_string());
            }
        };
        debug!(criterion = %spec.id, reply = %reply, "grader reply");

        match parse_criterion_reply(&reply, spec) {
            Ok(result) => result,
            Err(err) => {
                warn!(criterion = %spec.id, error = %err, "grader reply could not be parsed");
                CriterionResult::failure(spec, format!("unparseable grader reply: {err}"))
            }
        }
    }

    /// Scores a single reply against a free-form expectation, 0..=10.
    pub async fn grade_turn(
        &self,
        query: &str,
        reply: &str,
        expectation: &str,
    ) -> Result<(f64, String), EvaluationError> {
        let prompt = turn_prompt(query, reply, expectation)?;
        let raw = self.complete(prompt, self.flow_max_tokens).await?;
        Ok(parse_turn_grade(&raw)?)
    }

    /// Free-text commentary on the conversation as a whole. Failures are folded into the text.
    pub async fn analyze_flow(&self, scenario: &Scenario, history: &ConversationHistory) -> String {
        let prompt = match flow_prompt(&scenario.summary(), history) {
            Ok(prompt) => prompt,
            Err(err) => return format!("Flow analysis unavailable: {err}"),
        };

        match self.complete(prompt, self.flow_max_tokens).await {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!(error = %err, "flow analysis failed");
                format!("Flow analysis unavailable: {err}")
            }
        }
    }

    /// Grades every rubric criterion concurrently and folds the results into one evaluation.
    pub async fn evaluate_conversation(
        &self,
        scenario: &Scenario,
        history: &ConversationHistory,
        gate: &QualityGate,
    ) -> Result<ConversationEvaluation, EvaluationError> {
        self.check_backend().await?;

        let mut pending = FuturesUnordered::new();
        for (index, spec) in self.rubric.criteria().iter().enumerate() {
            pending.push(async move { (index, self.evaluate_criterion(spec, scenario, history).await) });
        }

        let mut graded = Vec::with_capacity(self.rubric.len());
        while let Some(entry) = pending.next().await {
            graded.push(entry);
        }
        graded.sort_by_key(|(index, _)| *index);
        let results = graded.into_iter().map(|(_, result)| result).collect();

        let analysis = self.analyze_flow(scenario, history).await;
        let evaluation = aggregate(
            &scenario.meta.name,
            history.len(),
            &self.rubric,
            results,
            analysis,
            gate,
        );

        info!(
            scenario = %scenario.meta.name,
            percentage = evaluation.success_percentage,
            critical = evaluation.critical_failures.len(),
            passed = evaluation.passes_quality_gate,
            "conversation evaluated"
        );
        Ok(evaluation)
    }
}

pub mod client;
pub mod config;
pub mod error;
pub mod eval;
pub mod history;
pub mod judge;
pub mod providers;
pub mod retry;
pub mod run_log;
pub mod types;

pub use client::{AssistantClient, ClientError, Credentials, HttpAssistantClient, ResponseBundle, Session};
pub use config::{ConfigError, HarnessConfig};
pub use error::LLMError;
pub use eval::{
    load_scenarios, RunReport, RunSummary, Scenario, ScenarioOrchestrator, ScenarioResult, StepResult, Verdict,
};
pub use history::{ConversationHistory, ConversationTurn, HistoryStore, ScenarioContext};
pub use judge::{
    ConversationEvaluation, CriterionEvaluator, CriterionResult, EvaluationError, QualityGate, Rubric, Severity,
    SuccessPolicy,
};
pub use providers::LLMProvider;
pub use retry::RetryPolicy;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};

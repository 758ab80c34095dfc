//! LLM-as-judge grading of recorded conversations.

pub mod aggregate;
pub mod criteria;
pub mod evaluator;
pub mod parse;
pub mod prompt;

pub use aggregate::{aggregate, ConversationEvaluation, QualityGate, SuccessPolicy};
pub use criteria::{CriterionSpec, Rubric, Severity};
pub use evaluator::{CriterionEvaluator, EvaluationError};
pub use parse::{CriterionResult, ParseError};

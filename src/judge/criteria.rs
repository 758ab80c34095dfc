use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// How bad a criterion's shortcomings are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Unrecognised labels fall back to `Medium`.
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Severity::parse_lenient(&label))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionSpec {
    pub id: String,
    pub title: String,
    pub focus: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_score() -> f64 {
    10.0
}

impl CriterionSpec {
    pub fn new(id: impl Into<String>, title: impl Into<String>, focus: &[&str]) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            focus: focus.iter().map(|item| item.to_string()).collect(),
            weight: default_weight(),
            max_score: default_max_score(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Ordered criterion table the grader walks through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    criteria: Vec<CriterionSpec>,
}

impl Rubric {
    pub fn new(criteria: Vec<CriterionSpec>) -> Self {
        Self { criteria }
    }

    /// The ten criteria every conversation is graded on.
    pub fn standard() -> Self {
        Self::new(vec![
            CriterionSpec::new(
                "accuracy",
                "Accuracy",
                &[
                    "Are the facts and data in the answers correct?",
                    "Does the assistant avoid hallucinating or inventing information?",
                    "Are numbers, dates and names stated precisely?",
                ],
            )
            .with_weight(1.5),
            CriterionSpec::new(
                "relevance",
                "Relevance",
                &[
                    "Does every answer address what the user actually asked?",
                    "Does the assistant stay on topic?",
                    "Is unnecessary digression avoided?",
                ],
            )
            .with_weight(1.2),
            CriterionSpec::new(
                "completeness",
                "Completeness",
                &[
                    "Are all parts of each request handled?",
                    "Is any expected information missing?",
                    "Are follow-up needs anticipated where obvious?",
                ],
            ),
            CriterionSpec::new(
                "tool_usage",
                "Tool usage",
                &[
                    "Are the right plugins or functions invoked for the task?",
                    "Are tool results reflected correctly in the answer?",
                    "Are tools avoided when they are not needed?",
                ],
            )
            .with_weight(1.3),
            CriterionSpec::new(
                "context_understanding",
                "Context understanding",
                &[
                    "Does the assistant understand references to earlier turns?",
                    "Are pronouns and implicit subjects resolved correctly?",
                    "Is the user's underlying intent recognised?",
                ],
            )
            .with_weight(1.2),
            CriterionSpec::new(
                "proactivity",
                "Proactivity",
                &[
                    "Does the assistant offer useful next steps?",
                    "Does it ask clarifying questions when a request is ambiguous?",
                ],
            )
            .with_weight(0.8),
            CriterionSpec::new(
                "conversation_flow",
                "Conversation flow",
                &[
                    "Do the turns connect naturally?",
                    "Is the tone consistent across the conversation?",
                    "Are transitions between topics handled smoothly?",
                ],
            ),
            CriterionSpec::new(
                "error_handling",
                "Error handling",
                &[
                    "Are failures and missing data communicated honestly?",
                    "Does the assistant recover gracefully from bad input?",
                    "Are fallbacks offered when something cannot be done?",
                ],
            ),
            CriterionSpec::new(
                "memory_usage",
                "Memory usage",
                &[
                    "Is information given earlier in the conversation remembered?",
                    "Are stored user preferences applied?",
                    "Does the assistant avoid asking for things it already knows?",
                ],
            ),
            CriterionSpec::new(
                "personalization",
                "Personalization",
                &[
                    "Is the answer adapted to this particular user?",
                    "Does the assistant use the user's name, habits or preferences where appropriate?",
                ],
            )
            .with_weight(0.8),
        ])
    }

    pub fn criteria(&self) -> &[CriterionSpec] {
        &self.criteria
    }

    pub fn get(&self, id: &str) -> Option<&CriterionSpec> {
        self.criteria.iter().find(|criterion| criterion.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.criteria.iter().position(|criterion| criterion.id == id)
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

impl Default for Rubric {
    fn default() -> Self {
        Self::standard()
    }
}

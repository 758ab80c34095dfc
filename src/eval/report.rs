use std::{collections::BTreeMap, fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{eval::assertions::AssertionOutcome, judge::ConversationEvaluation};

/// Which rule decided a scenario's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    QualityGate,
    LocalSteps,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub kind: String,
    /// What the scenario author expected the assistant to do at this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_action: Option<String>,
    pub success: bool,
    pub input: Value,
    pub output: Value,
    pub assertions: Vec<AssertionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub tags: Vec<String>,
    pub steps: Vec<StepResult>,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_evaluation: Option<ConversationEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_error: Option<String>,
    pub verdict: Verdict,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioResult {
    /// Fraction of passed steps; a scenario without steps scores 0.
    pub fn step_success_rate(steps: &[StepResult]) -> f64 {
        if steps.is_empty() {
            return 0.0;
        }
        let passed = steps.iter().filter(|step| step.success).count();
        passed as f64 / steps.len() as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub scenarios: usize,
    pub passed_scenarios: usize,
    pub failed_scenarios: usize,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    /// Scenario-level errors: aborted scenarios and failed evaluations.
    pub errors: usize,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn from_results(results: &[ScenarioResult], elapsed_secs: f64) -> Self {
        let mut summary = RunSummary {
            scenarios: results.len(),
            elapsed_secs,
            ..RunSummary::default()
        };

        for result in results {
            if result.success {
                summary.passed_scenarios += 1;
            } else {
                summary.failed_scenarios += 1;
            }
            summary.total_steps += result.steps.len();
            summary.passed_steps += result.passed_steps;
            summary.failed_steps += result.failed_steps;
            if result.error.is_some() || result.evaluation_error.is_some() {
                summary.errors += 1;
            }
        }

        summary
    }

    pub fn pass_fraction(&self) -> f64 {
        if self.scenarios == 0 {
            0.0
        } else {
            self.passed_scenarios as f64 / self.scenarios as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub results: Vec<ScenarioResult>,
    pub summary: RunSummary,
    pub min_pass_fraction: f64,
    pub passed: bool,
    /// Conversation transcripts keyed by scenario name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transcripts: BTreeMap<String, String>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, results: Vec<ScenarioResult>, elapsed_secs: f64, min_pass_fraction: f64) -> Self {
        let summary = RunSummary::from_results(&results, elapsed_secs);
        let passed = summary.scenarios > 0 && summary.pass_fraction() >= min_pass_fraction;
        Self {
            started_at,
            results,
            summary,
            min_pass_fraction,
            passed,
            transcripts: BTreeMap::new(),
        }
    }

    pub fn with_transcripts(mut self, transcripts: BTreeMap<String, String>) -> Self {
        self.transcripts = transcripts;
        self
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        fs::write(path, body)
    }
}

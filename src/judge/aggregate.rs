use serde::{Deserialize, Serialize};

use crate::{
    eval::report::Verdict,
    judge::{criteria::Rubric, parse::CriterionResult},
};

/// Pass mark for the summed criterion scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub threshold_percent: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            threshold_percent: 75.0,
        }
    }
}

impl QualityGate {
    pub fn new(threshold_percent: f64) -> Self {
        Self { threshold_percent }
    }

    /// Passing needs the threshold and zero critical failures.
    pub fn passes(&self, success_percentage: f64, critical_failures: &[String]) -> bool {
        success_percentage >= self.threshold_percent && critical_failures.is_empty()
    }
}

/// Turns a scenario's evaluation (or its absence) into pass/fail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessPolicy {
    /// Minimum evaluated score fraction, applied on top of the gate.
    pub score_floor: f64,
    /// Step pass-rate used when no evaluation exists.
    pub local_step_threshold: f64,
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self {
            score_floor: 0.75,
            local_step_threshold: 0.7,
        }
    }
}

impl SuccessPolicy {
    pub fn decide(&self, evaluation: Option<&ConversationEvaluation>, step_success_rate: f64) -> (bool, Verdict) {
        match evaluation {
            Some(evaluation) => (
                evaluation.passes_quality_gate
                    && evaluation.success_percentage / 100.0 >= self.score_floor,
                Verdict::QualityGate,
            ),
            None => (step_success_rate >= self.local_step_threshold, Verdict::LocalSteps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvaluation {
    pub scenario_name: String,
    pub turn_count: usize,
    pub criteria_results: Vec<CriterionResult>,
    pub total_score: f64,
    pub max_possible_score: f64,
    pub success_percentage: f64,
    /// Weighted by rubric weights. Reported only; the gate uses `success_percentage`.
    pub weighted_percentage: f64,
    pub critical_failures: Vec<String>,
    pub overall_issues: Vec<String>,
    pub overall_suggestions: Vec<String>,
    pub conversation_analysis: String,
    pub quality_threshold: f64,
    pub passes_quality_gate: bool,
}

fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        (part / whole * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

pub fn aggregate(
    scenario_name: &str,
    turn_count: usize,
    rubric: &Rubric,
    criteria_results: Vec<CriterionResult>,
    conversation_analysis: String,
    gate: &QualityGate,
) -> ConversationEvaluation {
    let mut total_score = 0.0;
    let mut max_possible_score = 0.0;
    let mut weighted_score = 0.0;
    let mut weighted_max = 0.0;
    let mut critical_failures = Vec::new();
    let mut overall_issues = Vec::new();
    let mut overall_suggestions = Vec::new();

    for result in &criteria_results {
        let weight = rubric
            .get(&result.criterion)
            .map(|spec| spec.weight)
            .unwrap_or(1.0);

        total_score += result.score;
        max_possible_score += result.max_score;
        weighted_score += weight * result.score;
        weighted_max += weight * result.max_score;

        if result.is_critical() {
            critical_failures.extend(result.issues.iter().cloned());
        }
        overall_issues.extend(result.issues.iter().cloned());
        overall_suggestions.extend(result.suggestions.iter().cloned());
    }

    let success_percentage = percentage(total_score, max_possible_score);
    let passes_quality_gate = gate.passes(success_percentage, &critical_failures);

    ConversationEvaluation {
        scenario_name: scenario_name.to_string(),
        turn_count,
        criteria_results,
        total_score,
        max_possible_score,
        success_percentage,
        weighted_percentage: percentage(weighted_score, weighted_max),
        critical_failures,
        overall_issues,
        overall_suggestions,
        conversation_analysis,
        quality_threshold: gate.threshold_percent,
        passes_quality_gate,
    }
}

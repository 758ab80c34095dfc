use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    client::ResponseBundle,
    eval::scenario::{Assertion, AssertionKind, AssertionTarget},
    judge::CriterionEvaluator,
};

/// The value an assertion target points at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<'a> {
    Text(&'a str),
    Structured(&'a Value),
    Missing,
}

impl<'a> Resolved<'a> {
    fn as_text(&self) -> Option<String> {
        match self {
            Resolved::Text(text) => Some(text.to_string()),
            Resolved::Structured(Value::String(text)) => Some(text.clone()),
            Resolved::Structured(value) => Some(value.to_string()),
            Resolved::Missing => None,
        }
    }
}

impl AssertionTarget {
    pub fn resolve<'a>(&self, output: &'a ResponseBundle) -> Resolved<'a> {
        match self {
            AssertionTarget::AssistantText => Resolved::Text(&output.text),
            AssertionTarget::AssistantAudioPath => output
                .audio_path
                .as_deref()
                .map_or(Resolved::Missing, Resolved::Text),
            AssertionTarget::PluginResult => output
                .plugin_result
                .as_ref()
                .map_or(Resolved::Missing, Resolved::Structured),
            AssertionTarget::SideEffect => output
                .side_effect
                .as_ref()
                .map_or(Resolved::Missing, Resolved::Structured),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionTarget::AssistantText => "assistant_text",
            AssertionTarget::AssistantAudioPath => "assistant_audio_path",
            AssertionTarget::PluginResult => "plugin_result",
            AssertionTarget::SideEffect => "side_effect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub kind: AssertionKind,
    pub target: AssertionTarget,
    pub passed: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

impl AssertionOutcome {
    fn new(assertion: &Assertion, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            kind: assertion.kind.clone(),
            target: assertion.target,
            passed,
            detail: detail.into(),
            grade: None,
            threshold: None,
            observed: None,
        }
    }

    fn graded(mut self, grade: f64, threshold: f64) -> Self {
        self.grade = Some(grade);
        self.threshold = Some(threshold);
        self
    }

    fn observed(mut self, observed: Option<String>) -> Self {
        self.observed = observed;
        self
    }
}

/// Scores a structured action result against the effect the scenario expects.
///
/// No data scores 0, a reported failure 2, a confirmed match 10 and an
/// unconfirmed success 7.
pub fn grade_effect(expected_effect: Option<&str>, result: Option<&Value>) -> (f64, String) {
    let result = match result {
        Some(Value::Null) | None => return (0.0, "No result data to verify effect".to_string()),
        Some(Value::Object(map)) if map.is_empty() => {
            return (0.0, "No result data to verify effect".to_string())
        }
        Some(result) => result,
    };

    if result.get("success").and_then(Value::as_bool) != Some(true) {
        let error = match result.get("error") {
            Some(Value::String(text)) => text.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => "Unknown error".to_string(),
        };
        return (2.0, format!("Effect failed: {error}"));
    }

    let Some(expected) = expected_effect.map(str::trim).filter(|effect| !effect.is_empty()) else {
        return (7.0, "Effect occurred but no expected effect was declared".to_string());
    };

    if effect_matches(expected, result) {
        (10.0, format!("Expected effect `{expected}` confirmed"))
    } else {
        (7.0, format!("Effect occurred but unclear if it matches expected: {expected}"))
    }
}

fn effect_matches(expected: &str, result: &Value) -> bool {
    let named = ["action", "effect"]
        .iter()
        .filter_map(|field| result.get(*field).and_then(Value::as_str))
        .any(|value| value.eq_ignore_ascii_case(expected));
    if named {
        return true;
    }

    // `habit_add` is confirmed by any string value mentioning `habit`; keys never count.
    let subject = expected.split('_').next().unwrap_or_default().to_lowercase();
    !subject.is_empty() && mentions(result, &subject)
}

fn mentions(value: &Value, subject: &str) -> bool {
    match value {
        Value::String(text) => text.to_lowercase().contains(subject),
        Value::Array(items) => items.iter().any(|item| mentions(item, subject)),
        Value::Object(map) => map.values().any(|item| mentions(item, subject)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Checks step assertions against what the assistant returned.
pub struct AssertionVerifier {
    evaluator: Option<Arc<CriterionEvaluator>>,
    semantic_threshold: f64,
    effect_threshold: f64,
}

impl AssertionVerifier {
    pub fn new(evaluator: Option<Arc<CriterionEvaluator>>) -> Self {
        Self {
            evaluator,
            semantic_threshold: 7.0,
            effect_threshold: 8.0,
        }
    }

    pub fn with_thresholds(mut self, semantic: f64, effect: f64) -> Self {
        self.semantic_threshold = semantic;
        self.effect_threshold = effect;
        self
    }

    pub async fn verify_all(
        &self,
        assertions: &[Assertion],
        query: &str,
        output: &ResponseBundle,
    ) -> Vec<AssertionOutcome> {
        let mut outcomes = Vec::with_capacity(assertions.len());
        for assertion in assertions {
            outcomes.push(self.verify(assertion, query, output).await);
        }
        outcomes
    }

    pub async fn verify(&self, assertion: &Assertion, query: &str, output: &ResponseBundle) -> AssertionOutcome {
        let resolved = assertion.target.resolve(output);
        let outcome = match &assertion.kind {
            AssertionKind::Contains => self.check_contains(assertion, resolved),
            AssertionKind::SemanticOk => self.check_semantic(assertion, query, resolved).await,
            AssertionKind::EffectOk => self.check_effect(assertion, output, resolved),
            AssertionKind::JsonpathEq => {
                AssertionOutcome::new(assertion, false, "jsonpath_eq assertions are not implemented")
            }
            AssertionKind::Unknown(kind) => {
                AssertionOutcome::new(assertion, false, format!("unknown assertion kind `{kind}`"))
            }
        };
        debug!(kind = %assertion.kind, passed = outcome.passed, detail = %outcome.detail, "assertion checked");
        outcome
    }

    fn check_contains(&self, assertion: &Assertion, resolved: Resolved<'_>) -> AssertionOutcome {
        let needle = assertion.value.as_deref().unwrap_or_default();
        let haystack = resolved.as_text();

        let outcome = match haystack.as_deref() {
            _ if needle.is_empty() => AssertionOutcome::new(assertion, false, "contains assertion has no value"),
            None => AssertionOutcome::new(
                assertion,
                false,
                format!("{} has no value", assertion.target.as_str()),
            ),
            Some(text) if text.is_empty() => AssertionOutcome::new(
                assertion,
                false,
                format!("{} is empty", assertion.target.as_str()),
            ),
            Some(text) if text.to_lowercase().contains(&needle.to_lowercase()) => {
                AssertionOutcome::new(assertion, true, format!("found `{needle}`"))
            }
            Some(_) => AssertionOutcome::new(assertion, false, format!("`{needle}` not found")),
        };
        outcome.observed(haystack)
    }

    async fn check_semantic(&self, assertion: &Assertion, query: &str, resolved: Resolved<'_>) -> AssertionOutcome {
        let threshold = assertion.threshold.unwrap_or(self.semantic_threshold);
        let Some(evaluator) = self.evaluator.as_ref() else {
            return AssertionOutcome::new(assertion, false, "no grader configured for semantic_ok");
        };
        let Some(reply) = resolved.as_text() else {
            return AssertionOutcome::new(
                assertion,
                false,
                format!("{} has no value", assertion.target.as_str()),
            );
        };
        let expectation = assertion
            .value
            .as_deref()
            .unwrap_or("a helpful, relevant and correct reply");

        match evaluator.grade_turn(query, &reply, expectation).await {
            Ok((grade, comments)) => AssertionOutcome::new(
                assertion,
                grade >= threshold,
                format!("graded {grade:.1}/10: {comments}"),
            )
            .graded(grade, threshold)
            .observed(Some(reply)),
            Err(err) => AssertionOutcome::new(assertion, false, format!("semantic grading failed: {err}"))
                .observed(Some(reply)),
        }
    }

    fn check_effect(&self, assertion: &Assertion, output: &ResponseBundle, resolved: Resolved<'_>) -> AssertionOutcome {
        let threshold = assertion.threshold.unwrap_or(self.effect_threshold);
        let data = match resolved {
            Resolved::Structured(value) => Some(value),
            Resolved::Text(_) | Resolved::Missing => {
                output.plugin_result.as_ref().or(output.side_effect.as_ref())
            }
        };
        let expected = assertion.expected_effect.as_deref().or(assertion.value.as_deref());

        let (grade, detail) = grade_effect(expected, data);
        AssertionOutcome::new(assertion, grade >= threshold, detail)
            .graded(grade, threshold)
            .observed(data.map(Value::to_string))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::retry::RetryPolicy;

    fn reply(text: &str) -> ResponseBundle {
        ResponseBundle::text(text)
    }

    fn grader(response: &str) -> Arc<CriterionEvaluator> {
        let provider = ScriptedProvider::new(vec!["judge".into()]).with_response(response);
        Arc::new(CriterionEvaluator::new(Arc::new(provider), "judge").with_retry(RetryPolicy::none()))
    }

    #[tokio::test]
    async fn contains_is_case_insensitive() {
        let verifier = AssertionVerifier::new(None);
        let outcome = verifier
            .verify(&Assertion::contains("WARSAW"), "q", &reply("It is sunny in Warsaw."))
            .await;
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn contains_fails_on_empty_needle_or_haystack() {
        let verifier = AssertionVerifier::new(None);
        assert!(!verifier.verify(&Assertion::contains(""), "q", &reply("text")).await.passed);
        assert!(!verifier.verify(&Assertion::contains("x"), "q", &reply("")).await.passed);

        let audio = Assertion::contains("wav").with_target(AssertionTarget::AssistantAudioPath);
        let outcome = verifier.verify(&audio, "q", &reply("text")).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("assistant_audio_path"));
    }

    #[tokio::test]
    async fn semantic_without_grader_fails() {
        let verifier = AssertionVerifier::new(None);
        let assertion = Assertion::new(AssertionKind::SemanticOk).with_value("greets");
        let outcome = verifier.verify(&assertion, "hi", &reply("hello")).await;
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("no grader"));
    }

    #[tokio::test]
    async fn semantic_uses_assertion_threshold() {
        let assertion = Assertion::new(AssertionKind::SemanticOk)
            .with_value("greets")
            .with_threshold(6.0);
        let verifier = AssertionVerifier::new(Some(grader(r#"{"score": 6.5, "comments": "ok"}"#)));
        let outcome = verifier.verify(&assertion, "hi", &reply("hello")).await;
        assert!(outcome.passed);
        assert_eq!(outcome.grade, Some(6.5));
        assert_eq!(outcome.threshold, Some(6.0));

        let strict = AssertionVerifier::new(Some(grader(r#"{"score": 6.5, "comments": "ok"}"#)));
        let default_threshold = Assertion::new(AssertionKind::SemanticOk).with_value("greets");
        assert!(!strict.verify(&default_threshold, "hi", &reply("hello")).await.passed);
    }

    #[test]
    fn effect_subject_ignores_result_keys() {
        let result = json!({"success": true, "action": "noop", "details": {"notes": ["nothing"]}});
        assert_eq!(grade_effect(Some("success_notice"), Some(&result)).0, 7.0);
        assert_eq!(grade_effect(Some("action_logged"), Some(&result)).0, 7.0);

        let nested = json!({"success": true, "items": [{"title": "Calendar entry saved"}]});
        assert_eq!(grade_effect(Some("calendar_add"), Some(&nested)).0, 10.0);
    }

    #[test]
    fn effect_grades_follow_the_four_tiers() {
        assert_eq!(grade_effect(Some("habit_add"), None).0, 0.0);
        assert_eq!(
            grade_effect(Some("habit_add"), Some(&json!({"success": false, "error": "db down"}))),
            (2.0, "Effect failed: db down".to_string())
        );
        assert_eq!(
            grade_effect(Some("habit_add"), Some(&json!({"success": true, "created": "Habit: run"}))).0,
            10.0
        );
        assert_eq!(
            grade_effect(Some("service_restarted"), Some(&json!({"success": true, "action": "service_restarted"}))).0,
            10.0
        );
        assert_eq!(
            grade_effect(Some("calendar_add"), Some(&json!({"success": true, "action": "noop"}))).0,
            7.0
        );
    }

    #[tokio::test]
    async fn effect_reads_plugin_result_and_thresholds() {
        let verifier = AssertionVerifier::new(None);
        let mut output = reply("done");
        output.plugin_result = Some(json!({"success": true, "action": "restart_gaja", "simulated": true}));

        let assertion = Assertion::new(AssertionKind::EffectOk).with_expected_effect("restart_gaja");
        let outcome = verifier.verify(&assertion, "", &output).await;
        assert!(outcome.passed);
        assert_eq!(outcome.grade, Some(10.0));

        let vague = Assertion::new(AssertionKind::EffectOk).with_expected_effect("calendar_add");
        let outcome = verifier.verify(&vague, "", &output).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.threshold, Some(8.0));
    }

    #[tokio::test]
    async fn jsonpath_and_unknown_kinds_fail() {
        let verifier = AssertionVerifier::new(None);
        let jsonpath = verifier
            .verify(&Assertion::new(AssertionKind::JsonpathEq), "", &reply("x"))
            .await;
        assert!(!jsonpath.passed);
        assert_eq!(jsonpath.detail, "jsonpath_eq assertions are not implemented");

        let unknown = verifier
            .verify(&Assertion::new(AssertionKind::Unknown("regex".into())), "", &reply("x"))
            .await;
        assert!(!unknown.passed);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::judge::criteria::{CriterionSpec, Severity};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("grader reply contains no JSON object")]
    NoJson,
    #[error("grader reply has an unterminated JSON object")]
    Unbalanced,
    #[error("grader reply JSON is invalid: {0}")]
    Invalid(String),
    #[error("grader reply has no `score` field")]
    MissingScore,
    #[error("grader reply has a non-numeric score: {0}")]
    InvalidScore(String),
}

/// Graded outcome of a single criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub score: f64,
    pub max_score: f64,
    pub reasoning: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub severity: Severity,
}

impl CriterionResult {
    /// Zero-score critical result standing in for a criterion that could not be graded.
    pub fn failure(spec: &CriterionSpec, reason: impl AsRef<str>) -> Self {
        let reason = reason.as_ref();
        Self {
            criterion: spec.id.clone(),
            score: 0.0,
            max_score: spec.max_score,
            reasoning: format!("Evaluation of {} failed: {reason}", spec.title),
            issues: vec![format!("Evaluation failed: {reason}")],
            suggestions: Vec::new(),
            severity: Severity::Critical,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Returns the first balanced `{...}` span of `text` that decodes as a JSON object.
///
/// Braces inside string literals (including escaped quotes) are ignored.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, ParseError> {
    let mut last_error = None;
    let mut saw_open = false;

    for (start, _) in text.char_indices().filter(|(_, ch)| *ch == '{') {
        saw_open = true;
        let Some(end) = matching_brace(&text[start..]) else {
            last_error.get_or_insert(ParseError::Unbalanced);
            continue;
        };

        match serde_json::from_str::<Value>(&text[start..start + end]) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(_) => {}
            Err(err) => last_error = Some(ParseError::Invalid(err.to_string())),
        }
    }

    match (saw_open, last_error) {
        (false, _) => Err(ParseError::NoJson),
        (true, Some(err)) => Err(err),
        (true, None) => Err(ParseError::Unbalanced),
    }
}

/// Byte length of the object opening at `text[0]`, or `None` if it never closes.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text.char_indices() {
        if in_string {
            match (escaped, ch) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}

/// Decodes a criterion grading reply.
pub fn parse_criterion_reply(reply: &str, spec: &CriterionSpec) -> Result<CriterionResult, ParseError> {
    let object = extract_json_object(reply)?;

    let score = match object.get("score") {
        None | Some(Value::Null) => return Err(ParseError::MissingScore),
        Some(value) => number_from(value).ok_or_else(|| ParseError::InvalidScore(value.to_string()))?,
    };

    let max_score = object
        .get("max_score")
        .and_then(number_from)
        .filter(|max| max.is_finite() && *max >= 0.0)
        .unwrap_or(spec.max_score);

    let severity = object
        .get("severity")
        .and_then(Value::as_str)
        .map(Severity::parse_lenient)
        .unwrap_or_default();

    Ok(CriterionResult {
        criterion: spec.id.clone(),
        score: score.clamp(0.0, max_score),
        max_score,
        reasoning: object
            .get("reasoning")
            .map(text_from)
            .unwrap_or_default(),
        issues: list_from(object.get("issues")),
        suggestions: list_from(object.get("suggestions")),
        severity,
    })
}

/// Decodes a `{"score": n, "comments": "..."}` single-turn grade.
pub fn parse_turn_grade(reply: &str) -> Result<(f64, String), ParseError> {
    let object = extract_json_object(reply)?;
    let score = match object.get("score") {
        None | Some(Value::Null) => return Err(ParseError::MissingScore),
        Some(value) => number_from(value).ok_or_else(|| ParseError::InvalidScore(value.to_string()))?,
    };
    let comments = object.get("comments").map(text_from).unwrap_or_default();
    Ok((score.clamp(0.0, 10.0), comments))
}

fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|n| n.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn text_from(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn list_from(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().map(text_from).collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.clone()],
        _ => Vec::new(),
    }
}

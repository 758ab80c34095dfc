use std::{
    convert::TryFrom,
    fmt, fs,
    path::{Path, PathBuf},
};

use jsonschema::{Draft, JSONSchema};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("{} does not match the scenario schema: {}", .path.display(), .errors.join("; "))]
    Invalid { path: PathBuf, errors: Vec<String> },
    #[error("scenario schema could not be compiled: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScenarioMeta {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A scripted multi-turn conversation plus what a good assistant should do in it.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_behaviors: Vec<String>,
    #[schemars(with = "Vec<RawStep>")]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            meta: ScenarioMeta {
                name: name.into(),
                tags: Vec::new(),
            },
            description: description.into(),
            expected_behaviors: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    pub fn with_expected_behavior(mut self, behavior: impl Into<String>) -> Self {
        self.expected_behaviors.push(behavior.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Name and description, as shown to the grader.
    pub fn summary(&self) -> String {
        if self.description.trim().is_empty() {
            self.meta.name.clone()
        } else {
            format!("{}: {}", self.meta.name, self.description.trim())
        }
    }

    /// True when any filter is a substring of the name or equals a tag. No filters match everything.
    pub fn matches(&self, filters: &[String]) -> bool {
        filters.is_empty()
            || filters.iter().any(|filter| {
                self.meta.name.contains(filter.as_str()) || self.meta.tags.iter().any(|tag| tag == filter)
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Text { message: String },
    Audio { tts_text: String, audio_path: Option<PathBuf> },
    Action { action: String },
    Wait { seconds: f64 },
    Restart,
    /// A kind this harness does not know; carried through so it can be reported.
    Unknown(String),
}

impl StepKind {
    pub fn name(&self) -> &str {
        match self {
            StepKind::Text { .. } => "text",
            StepKind::Audio { .. } => "audio",
            StepKind::Action { .. } => "action",
            StepKind::Wait { .. } => "wait",
            StepKind::Restart => "restart",
            StepKind::Unknown(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub kind: StepKind,
    /// Informational label of what the assistant is expected to do.
    pub expected_action: Option<String>,
    pub assertions: Vec<Assertion>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            expected_action: None,
            assertions: Vec::new(),
        }
    }

    pub fn text(message: impl Into<String>) -> Self {
        Self::new(StepKind::Text {
            message: message.into(),
        })
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }
}

/// Longest pause a `wait` step may request.
pub const MAX_WAIT_SECONDS: f64 = 3_600.0;

/// Payload fields a step may carry, at the top level or under the older `data:` key.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct StepPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tts_text: Option<String>,
    #[serde(default)]
    audio_path: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct RawExpect {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct RawStep {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    payload: StepPayload,
    #[serde(default)]
    data: Option<StepPayload>,
    #[serde(default)]
    expect: Option<RawExpect>,
    #[serde(default)]
    assertions: Vec<Assertion>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let legacy = raw.data.unwrap_or_default();
        let payload = raw.payload;
        let message = payload.message.or(legacy.message);
        let tts_text = payload.tts_text.or(legacy.tts_text);
        let audio_path = payload.audio_path.or(legacy.audio_path);
        let action = payload.action.or(legacy.action);
        let seconds = payload.seconds.or(legacy.seconds);

        let kind = match raw.kind.as_str() {
            "text" | "send_text" => StepKind::Text {
                message: message.ok_or_else(|| format!("`{}` step requires `message`", raw.kind))?,
            },
            "audio" => StepKind::Audio {
                tts_text: tts_text
                    .or(message)
                    .ok_or_else(|| "`audio` step requires `tts_text`".to_string())?,
                audio_path: audio_path.map(PathBuf::from),
            },
            "action" => StepKind::Action {
                action: action.ok_or_else(|| "`action` step requires `action`".to_string())?,
            },
            "wait" => {
                let seconds = seconds.unwrap_or(1.0);
                if !(0.0..=MAX_WAIT_SECONDS).contains(&seconds) {
                    return Err(format!(
                        "`wait` step duration {seconds} is outside 0..={MAX_WAIT_SECONDS} seconds"
                    ));
                }
                StepKind::Wait { seconds }
            }
            "restart" | "restart_gaja" => StepKind::Restart,
            other => StepKind::Unknown(other.to_string()),
        };

        let RawExpect {
            action: expected_action,
            assertions: mut assertions,
        } = raw.expect.unwrap_or_default();
        assertions.extend(raw.assertions);

        Ok(Step {
            kind,
            expected_action,
            assertions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssertionKind {
    Contains,
    SemanticOk,
    EffectOk,
    JsonpathEq,
    Unknown(String),
}

impl AssertionKind {
    pub fn as_str(&self) -> &str {
        match self {
            AssertionKind::Contains => "contains",
            AssertionKind::SemanticOk => "semantic_ok",
            AssertionKind::EffectOk => "effect_ok",
            AssertionKind::JsonpathEq => "jsonpath_eq",
            AssertionKind::Unknown(kind) => kind.as_str(),
        }
    }
}

impl From<String> for AssertionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "contains" => AssertionKind::Contains,
            "semantic_ok" => AssertionKind::SemanticOk,
            "effect_ok" => AssertionKind::EffectOk,
            "jsonpath_eq" => AssertionKind::JsonpathEq,
            _ => AssertionKind::Unknown(value),
        }
    }
}

impl From<AssertionKind> for String {
    fn from(kind: AssertionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a step's output an assertion inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssertionTarget {
    #[default]
    AssistantText,
    AssistantAudioPath,
    PluginResult,
    SideEffect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Assertion {
    #[schemars(with = "String")]
    pub kind: AssertionKind,
    #[serde(default)]
    pub target: AssertionTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Assertion {
    pub fn new(kind: AssertionKind) -> Self {
        Self {
            kind,
            target: AssertionTarget::default(),
            value: None,
            expected_effect: None,
            threshold: None,
        }
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::new(AssertionKind::Contains).with_value(value)
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_target(mut self, target: AssertionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_expected_effect(mut self, effect: impl Into<String>) -> Self {
        self.expected_effect = Some(effect.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// JSON Schema (draft 7) describing scenario files.
pub fn scenario_schema() -> Value {
    serde_json::to_value(schema_for!(Scenario)).unwrap_or(Value::Null)
}

/// Validates and decodes scenario files.
pub struct ScenarioLoader {
    validator: JSONSchema,
}

impl ScenarioLoader {
    pub fn new() -> Result<Self, ScenarioError> {
        let schema = scenario_schema();
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|err| ScenarioError::Schema(err.to_string()))?;
        Ok(Self { validator })
    }

    /// Loads one file, or every `.yaml`/`.yml`/`.json` file of a directory ordered by file name.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<Scenario>, ScenarioError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Ok(vec![self.load_file(path)?]);
        }

        let entries = fs::read_dir(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ScenarioError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file = entry.path();
            let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                files.push(file);
            }
        }
        files.sort();

        files.iter().map(|file| self.load_file(file)).collect()
    }

    pub fn load_file(&self, path: &Path) -> Result<Scenario, ScenarioError> {
        let bytes = fs::read(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let document: Value = if ext == "json" {
            serde_json::from_slice(&bytes).map_err(|err| parse_error(path, err))?
        } else {
            serde_yaml::from_slice(&bytes).map_err(|err| parse_error(path, err))?
        };

        self.decode(path, document)
    }

    pub fn decode(&self, path: &Path, document: Value) -> Result<Scenario, ScenarioError> {
        if let Err(errors) = self.validator.validate(&document) {
            return Err(ScenarioError::Invalid {
                path: path.to_path_buf(),
                errors: errors
                    .map(|error| format!("{} at `{}`", error, error.instance_path))
                    .collect(),
            });
        }

        serde_json::from_value(document).map_err(|err| parse_error(path, err))
    }
}

fn parse_error(path: &Path, err: impl fmt::Display) -> ScenarioError {
    ScenarioError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<Scenario>, ScenarioError> {
    ScenarioLoader::new()?.load(path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const WEATHER: &str = r#"
meta:
  name: weather_followup
  tags: [smoke, memory]
description: User asks about the weather and follows up.
expected_behaviors:
  - Gives the current weather
  - Remembers the city in the follow-up
steps:
  - type: text
    message: "What's the weather in Warsaw?"
    expect:
      action: respond
      assertions:
        - kind: contains
          value: warsaw
        - kind: semantic_ok
          value: describes current weather
          threshold: 6.5
  - type: send_text
    data:
      message: "And tomorrow?"
  - type: action
    action: restart_gaja
    expect:
      assertions:
        - kind: effect_ok
          target: plugin_result
          expected_effect: service_restarted
  - type: restart_gaja
  - type: wait
    seconds: 0.5
  - type: teleport
"#;

    fn decode(value: Value) -> Result<Scenario, ScenarioError> {
        ScenarioLoader::new()
            .expect("schema")
            .decode(Path::new("inline.json"), value)
    }

    #[test]
    fn yaml_scenario_decodes_with_aliases_and_legacy_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("weather.yaml");
        fs::write(&path, WEATHER).expect("write");

        let scenarios = load_scenarios(&path).expect("scenario");
        let scenario = &scenarios[0];
        assert_eq!(scenario.name(), "weather_followup");
        assert_eq!(scenario.expected_behaviors.len(), 2);
        assert_eq!(scenario.steps.len(), 6);

        let first = &scenario.steps[0];
        assert_eq!(first.kind.name(), "text");
        assert_eq!(first.assertions[0].kind, AssertionKind::Contains);
        assert_eq!(first.assertions[0].target, AssertionTarget::AssistantText);
        assert_eq!(first.assertions[1].threshold, Some(6.5));

        assert_eq!(
            scenario.steps[1].kind,
            StepKind::Text {
                message: "And tomorrow?".into()
            }
        );
        assert_eq!(scenario.steps[2].assertions[0].target, AssertionTarget::PluginResult);
        assert_eq!(scenario.steps[3].kind, StepKind::Restart);
        assert_eq!(scenario.steps[4].kind, StepKind::Wait { seconds: 0.5 });
        assert_eq!(scenario.steps[5].kind, StepKind::Unknown("teleport".into()));
    }

    #[test]
    fn unknown_assertion_kinds_are_kept() {
        let scenario = decode(json!({
            "meta": {"name": "x"},
            "steps": [{"type": "text", "message": "hi", "expect": {"assertions": [{"kind": "regex_match"}]}}]
        }))
        .expect("scenario");
        assert_eq!(
            scenario.steps[0].assertions[0].kind,
            AssertionKind::Unknown("regex_match".into())
        );
    }

    #[test]
    fn schema_rejects_missing_meta_and_bad_targets() {
        let missing_meta = decode(json!({"steps": []})).unwrap_err();
        assert!(matches!(missing_meta, ScenarioError::Invalid { .. }));

        let bad_target = decode(json!({
            "meta": {"name": "x"},
            "steps": [{"type": "text", "message": "hi", "assertions": [{"kind": "contains", "target": "somewhere"}]}]
        }))
        .unwrap_err();
        assert!(matches!(bad_target, ScenarioError::Invalid { .. }));
    }

    #[test]
    fn wait_durations_outside_the_bound_are_rejected() {
        for seconds in [json!(1e20), json!(-1.0), json!(3601)] {
            let error = decode(json!({
                "meta": {"name": "x"},
                "steps": [{"type": "wait", "seconds": seconds}]
            }))
            .unwrap_err();
            assert!(error.to_string().contains("outside 0..=3600"), "{error}");
        }

        let scenario = decode(json!({
            "meta": {"name": "x"},
            "steps": [{"type": "wait", "seconds": 3600}]
        }))
        .expect("scenario");
        assert_eq!(scenario.steps[0].kind, StepKind::Wait { seconds: 3_600.0 });
    }

    #[test]
    fn text_step_without_message_is_rejected() {
        let error = decode(json!({
            "meta": {"name": "x"},
            "steps": [{"type": "text"}]
        }))
        .unwrap_err();
        assert!(error.to_string().contains("requires `message`"));
    }

    #[test]
    fn directory_loading_is_sorted_and_skips_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.json"), r#"{"meta":{"name":"second"},"steps":[]}"#).expect("write");
        fs::write(dir.path().join("a.yml"), "meta:\n  name: first\nsteps: []\n").expect("write");
        fs::write(dir.path().join("notes.txt"), "ignore me").expect("write");

        let scenarios = load_scenarios(dir.path()).expect("scenarios");
        let names: Vec<_> = scenarios.iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn filters_match_names_and_tags() {
        let scenario = Scenario::new("weather_followup", "").with_tag("smoke");
        assert!(scenario.matches(&[]));
        assert!(scenario.matches(&["weather".to_string()]));
        assert!(scenario.matches(&["smoke".to_string()]));
        assert!(!scenario.matches(&["calendar".to_string()]));
    }
}

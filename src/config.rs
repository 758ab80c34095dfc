use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{providers::openai::DEFAULT_BASE_URL, retry::RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment variable `{0}` is referenced but not set")]
    MissingVariable(String),
}

/// `${NAME}` or `${NAME:-fallback}`.
static RE_ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env placeholder pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub target: TargetConfig,
    pub grader: GraderConfig,
    pub gate: GateConfig,
    pub runtime: RuntimeConfig,
}

/// The assistant service under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub conversation_id: String,
    pub request_timeout_ms: u64,
    pub step_timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            email: "admin@example.com".to_string(),
            password: String::new(),
            conversation_id: "e2e-conversation".to_string(),
            request_timeout_ms: 30_000,
            step_timeout_ms: 60_000,
        }
    }
}

impl TargetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// The OpenAI-compatible model used as judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub flow_max_tokens: u32,
    pub request_timeout_ms: u64,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "openai/gpt-oss-20b".to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 2_000,
            flow_max_tokens: 1_000,
            request_timeout_ms: 120_000,
        }
    }
}

impl GraderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Pass/fail thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum `success_percentage` (0..=100) for the quality gate.
    pub quality_threshold: f64,
    /// Minimum evaluated score fraction (0..=1) on top of the gate.
    pub score_floor: f64,
    /// Step pass-rate needed when no evaluation is available.
    pub local_step_threshold: f64,
    /// Fraction of scenarios that must pass for the run to pass.
    pub min_pass_fraction: f64,
    pub semantic_threshold: f64,
    pub effect_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 75.0,
            score_floor: 0.75,
            local_step_threshold: 0.7,
            min_pass_fraction: 0.5,
            semantic_threshold: 7.0,
            effect_threshold: 8.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub between_steps_ms: u64,
    pub log_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            between_steps_ms: 0,
            log_dir: PathBuf::from("logs"),
            retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn between_steps(&self) -> Duration {
        Duration::from_millis(self.between_steps_ms)
    }
}

impl HarnessConfig {
    /// Reads a YAML file, expands `${VAR}` placeholders and applies `E2E_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw, |name| env::var(name).ok())?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_yaml_str(
        raw: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let expanded = substitute_env(raw, lookup)?;
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("E2E_TARGET_URL") {
            self.target.base_url = url;
        }
        if let Some(email) = lookup("E2E_TARGET_EMAIL") {
            self.target.email = email;
        }
        if let Some(password) = lookup("E2E_TARGET_PASSWORD") {
            self.target.password = password;
        }
        if let Some(url) = lookup("E2E_GRADER_URL") {
            self.grader.base_url = url;
        }
        if let Some(model) = lookup("E2E_GRADER_MODEL") {
            self.grader.model = model;
        }
        if let Some(key) = lookup("E2E_GRADER_API_KEY") {
            self.grader.api_key = Some(key);
        }
    }
}

/// Expands `${NAME}` and `${NAME:-fallback}` placeholders.
pub fn substitute_env(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = RE_ENV_VAR.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingVariable(name)),
        None => Ok(expanded.into_owned()),
    }
}

use std::{fmt, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod http;

pub use http::HttpAssistantClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ClientError::Status { status, .. } => *status == 429 || *status >= 500,
            ClientError::Timeout(_) => true,
            ClientError::Serialization(_)
            | ClientError::Authentication(_)
            | ClientError::Unsupported(_) => false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated handle for one scenario run.
#[derive(Clone)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

/// Everything the assistant returned for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBundle {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect: Option<Value>,
    #[serde(default)]
    pub raw: Value,
    /// Set when the client could not really perform the request and returned a stand-in.
    #[serde(default)]
    pub placeholder: bool,
}

impl ResponseBundle {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ClientError>;

    async fn send_text(&self, session: &Session, message: &str) -> Result<ResponseBundle, ClientError>;

    /// Audio upload is optional; clients without it answer with a marked placeholder.
    async fn send_audio(&self, _session: &Session, audio_path: &Path) -> Result<ResponseBundle, ClientError> {
        Ok(ResponseBundle {
            text: "[audio input not implemented]".to_string(),
            audio_path: Some(audio_path.display().to_string()),
            placeholder: true,
            ..ResponseBundle::default()
        })
    }

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

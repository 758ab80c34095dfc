use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    client::{AssistantClient, ClientError, Credentials, ResponseBundle, Session},
    retry::RetryPolicy,
};

const LOGIN_PATH: &str = "/api/v1/auth/login";
const QUERY_PATH: &str = "/api/v1/ai/query";
const HEALTH_PATH: &str = "/health";

/// REST client for the assistant under test.
#[derive(Debug, Clone)]
pub struct HttpAssistantClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAssistantClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
            conversation_id: "e2e-conversation".to_string(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn query_once(&self, session: &Session, message: &str) -> Result<Value, ClientError> {
        let body = json!({
            "query": message,
            "context": {
                "conversation_id": self.conversation_id,
                "source": "e2e-test"
            }
        });

        let response = self
            .client
            .post(self.endpoint(QUERY_PATH))
            .bearer_auth(session.token())
            .json(&body)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Pulls the assistant's reply out of the payload shapes the server is known to use:
/// `{"response": "..."}`, `{"response": {"text": "..."}}` and `{"data": {"response": ...}}`.
pub fn extract_reply_text(payload: &Value) -> String {
    let response = payload
        .get("response")
        .or_else(|| payload.get("data").and_then(|data| data.get("response")));

    match response {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(map)) => match map.get("text").or_else(|| map.get("response")) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl AssistantClient for HttpAssistantClient {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        let response = self
            .client
            .post(self.endpoint(LOGIN_PATH))
            .json(&json!({
                "email": credentials.email,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(|err| ClientError::Authentication(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Authentication(format!("status {status}: {body}")));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Authentication(err.to_string()))?;

        match (login.success, login.token) {
            (true, Some(token)) if !token.is_empty() => {
                debug!(email = %credentials.email, "authenticated");
                Ok(Session::new(token))
            }
            (_, _) => Err(ClientError::Authentication(
                login
                    .error
                    .unwrap_or_else(|| "login response did not contain a token".to_string()),
            )),
        }
    }

    async fn send_text(&self, session: &Session, message: &str) -> Result<ResponseBundle, ClientError> {
        let payload = self
            .retry
            .run("send_text", ClientError::is_transient, || self.query_once(session, message))
            .await?;

        let text = extract_reply_text(&payload);
        let plugin_result = payload.get("plugin_result").cloned();
        let side_effect = payload.get("side_effect").cloned();

        Ok(ResponseBundle {
            text,
            plugin_result,
            side_effect,
            raw: payload,
            ..ResponseBundle::default()
        })
    }

    async fn health_check(&self) -> bool {
        match self.client.get(self.endpoint(HEALTH_PATH)).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "assistant health check failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "assistant health check unreachable");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

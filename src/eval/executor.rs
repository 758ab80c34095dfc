use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::{
    client::{AssistantClient, ClientError, ResponseBundle},
    eval::{
        assertions::AssertionVerifier,
        report::StepResult,
        scenario::{Step, StepKind},
    },
    history::{ConversationTurn, ScenarioContext},
};

/// Hook for side-effecting steps such as restarting the assistant.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run_action(&self, action: &str) -> Result<Value, String>;
}

/// Reports every action as done without touching anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedActions;

#[async_trait]
impl ActionRunner for SimulatedActions {
    async fn run_action(&self, action: &str) -> Result<Value, String> {
        Ok(json!({
            "success": true,
            "action": action,
            "simulated": true,
        }))
    }
}

/// Runs one scenario step at a time against the assistant.
pub struct StepExecutor {
    client: Arc<dyn AssistantClient>,
    actions: Arc<dyn ActionRunner>,
    verifier: AssertionVerifier,
    step_timeout: Duration,
    between_steps: Duration,
}

/// What a dispatched step produced before assertions run.
struct Dispatch {
    input: Value,
    query: Option<String>,
    output: Result<ResponseBundle, String>,
}

impl StepExecutor {
    pub fn new(client: Arc<dyn AssistantClient>, verifier: AssertionVerifier) -> Self {
        Self {
            client,
            actions: Arc::new(SimulatedActions),
            verifier,
            step_timeout: Duration::from_secs(60),
            between_steps: Duration::ZERO,
        }
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionRunner>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn with_between_steps(mut self, between_steps: Duration) -> Self {
        self.between_steps = between_steps;
        self
    }

    pub fn client(&self) -> &Arc<dyn AssistantClient> {
        &self.client
    }

    async fn call_client<F>(&self, call: F) -> Result<ResponseBundle, String>
    where
        F: Future<Output = Result<ResponseBundle, ClientError>>,
    {
        match timeout(self.step_timeout, call).await {
            Ok(Ok(bundle)) => Ok(bundle),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("step timed out after {} ms", self.step_timeout.as_millis())),
        }
    }

    async fn dispatch(&self, kind: &StepKind, context: &ScenarioContext) -> Dispatch {
        let session = &context.session;
        match kind {
            StepKind::Text { message } => Dispatch {
                input: json!({"type": "text", "text": message}),
                query: Some(message.clone()),
                output: self.call_client(self.client.send_text(session, message)).await,
            },
            StepKind::Audio { tts_text, audio_path } => match audio_path {
                Some(path) => Dispatch {
                    input: json!({"type": "audio", "text": tts_text, "audio_path": path.display().to_string()}),
                    query: Some(tts_text.clone()),
                    output: self.call_client(self.client.send_audio(session, path)).await,
                },
                None => {
                    // No recording to upload; send the transcript instead.
                    let spoken = format!("[AUDIO] {tts_text}");
                    let output = self.call_client(self.client.send_text(session, &spoken)).await;
                    Dispatch {
                        input: json!({"type": "audio", "text": tts_text}),
                        query: Some(spoken),
                        output,
                    }
                }
            },
            StepKind::Action { action } => self.dispatch_action(action).await,
            StepKind::Restart => self.dispatch_action("restart_gaja").await,
            StepKind::Wait { seconds } => {
                let output = match Duration::try_from_secs_f64(*seconds) {
                    Ok(pause) => {
                        sleep(pause).await;
                        Ok(ResponseBundle::text(format!("waited {seconds}s")))
                    }
                    Err(err) => Err(format!("invalid wait of {seconds}s: {err}")),
                };
                Dispatch {
                    input: json!({"type": "wait", "seconds": seconds}),
                    query: None,
                    output,
                }
            }
            StepKind::Unknown(kind) => {
                warn!(scenario = %context.scenario_name, kind = %kind, "unknown step kind, treating as passed");
                Dispatch {
                    input: json!({"type": kind}),
                    query: None,
                    output: Ok(ResponseBundle::text(format!("step kind `{kind}` skipped"))),
                }
            }
        }
    }

    async fn dispatch_action(&self, action: &str) -> Dispatch {
        let output = match timeout(self.step_timeout, self.actions.run_action(action)).await {
            Ok(Ok(result)) => Ok(ResponseBundle {
                text: format!("Action {action} executed"),
                plugin_result: Some(result.clone()),
                side_effect: Some(result.clone()),
                raw: result,
                ..ResponseBundle::default()
            }),
            Ok(Err(err)) => Err(format!("action `{action}` failed: {err}")),
            Err(_) => Err(format!("action `{action}` timed out after {} ms", self.step_timeout.as_millis())),
        };
        Dispatch {
            input: json!({"type": "action", "action": action}),
            query: None,
            output,
        }
    }

    /// Executes a step. Failures are recorded in the result, never raised.
    pub async fn execute(&self, step: &Step, index: usize, context: &mut ScenarioContext) -> StepResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        let Dispatch { input, query, output } = self.dispatch(&step.kind, context).await;

        if let Some(query) = query.as_ref() {
            let turn = match &output {
                Ok(bundle) => ConversationTurn::reply(index, query.clone(), bundle.text.clone(), bundle.raw.clone()),
                Err(err) => ConversationTurn::failed(index, query.clone(), err.clone()),
            };
            context.history.push(turn);
        }

        let (success, output_value, assertions, error) = match output {
            Ok(bundle) => {
                let assertions = self
                    .verifier
                    .verify_all(&step.assertions, query.as_deref().unwrap_or_default(), &bundle)
                    .await;
                let success = assertions.iter().all(|outcome| outcome.passed);
                let value = serde_json::to_value(&bundle).unwrap_or(Value::Null);
                (success, value, assertions, None)
            }
            Err(err) => (false, Value::Null, Vec::new(), Some(err)),
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        let kind = step.kind.name().to_string();

        if success {
            info!(scenario = %context.scenario_name, step = index, kind = %kind, duration_ms, "step passed");
        } else {
            let failed: Vec<&str> = assertions
                .iter()
                .filter(|outcome| !outcome.passed)
                .map(|outcome| outcome.detail.as_str())
                .collect();
            warn!(
                scenario = %context.scenario_name,
                step = index,
                kind = %kind,
                error = error.as_deref().unwrap_or(""),
                failed_assertions = ?failed,
                "step failed"
            );
        }

        if !self.between_steps.is_zero() {
            sleep(self.between_steps).await;
        }

        StepResult {
            index,
            kind,
            expected_action: step.expected_action.clone(),
            success,
            input,
            output: output_value,
            assertions,
            error,
            duration_ms,
            started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Mutex};

    use super::*;
    use crate::{
        client::{Credentials, Session},
        eval::scenario::Assertion,
        history::TurnResponse,
    };

    #[derive(Default)]
    struct RecordingClient {
        sent: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl AssistantClient for RecordingClient {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, ClientError> {
            Ok(Session::new("token"))
        }

        async fn send_text(&self, _session: &Session, message: &str) -> Result<ResponseBundle, ClientError> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message.to_string());
            }
            if self.fail_on == Some(message) {
                return Err(ClientError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(ResponseBundle::text(format!("echo: {message}")))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct SlowClient;

    #[async_trait]
    impl AssistantClient for SlowClient {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, ClientError> {
            Ok(Session::new("token"))
        }

        async fn send_text(&self, _session: &Session, _message: &str) -> Result<ResponseBundle, ClientError> {
            sleep(Duration::from_secs(5)).await;
            Ok(ResponseBundle::text("late"))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn executor(client: Arc<dyn AssistantClient>) -> StepExecutor {
        StepExecutor::new(client, AssertionVerifier::new(None))
    }

    fn context() -> ScenarioContext {
        ScenarioContext::new("unit", Session::new("token"))
    }

    #[tokio::test]
    async fn text_step_records_turn_and_checks_assertions() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        let step = Step::text("hello").with_assertion(Assertion::contains("ECHO"));

        let result = executor.execute(&step, 0, &mut context).await;
        assert!(result.success);
        assert_eq!(result.kind, "text");
        assert_eq!(context.history.len(), 1);
        assert_eq!(context.history.turns()[0].response.text(), Some("echo: hello"));
    }

    #[tokio::test]
    async fn failed_call_is_recorded_and_does_not_panic() {
        let client = Arc::new(RecordingClient {
            fail_on: Some("break"),
            ..RecordingClient::default()
        });
        let executor = executor(client);
        let mut context = context();

        let result = executor.execute(&Step::text("break"), 3, &mut context).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("500"));
        assert!(matches!(
            context.history.turns()[0].response,
            TurnResponse::Failed { .. }
        ));
        assert_eq!(context.history.turns()[0].step_index, 3);
    }

    #[tokio::test]
    async fn audio_without_file_falls_back_to_marked_text() {
        let client = Arc::new(RecordingClient::default());
        let executor = executor(client.clone());
        let mut context = context();
        let step = Step::new(StepKind::Audio {
            tts_text: "turn on the lights".into(),
            audio_path: None,
        });

        let result = executor.execute(&step, 0, &mut context).await;
        assert!(result.success);
        let sent = client.sent.lock().expect("lock").clone();
        assert_eq!(sent, vec!["[AUDIO] turn on the lights".to_string()]);
    }

    #[tokio::test]
    async fn audio_with_file_uses_client_placeholder() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        let step = Step::new(StepKind::Audio {
            tts_text: "hello".into(),
            audio_path: Some(Path::new("/tmp/hello.wav").to_path_buf()),
        });

        let result = executor.execute(&step, 0, &mut context).await;
        assert!(result.success);
        assert_eq!(result.output["placeholder"], json!(true));
        assert_eq!(context.history.len(), 1);
    }

    #[tokio::test]
    async fn actions_are_simulated_and_do_not_touch_history() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        let step = Step::new(StepKind::Action {
            action: "restart_gaja".into(),
        })
        .with_assertion(
            Assertion::new(crate::eval::scenario::AssertionKind::EffectOk)
                .with_expected_effect("restart_gaja"),
        );

        let result = executor.execute(&step, 0, &mut context).await;
        assert!(result.success);
        assert_eq!(result.output["plugin_result"]["simulated"], json!(true));
        assert!(context.history.is_empty());
    }

    #[tokio::test]
    async fn unknown_kinds_pass_without_history() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        let result = executor
            .execute(&Step::new(StepKind::Unknown("teleport".into())), 0, &mut context)
            .await;
        assert!(result.success);
        assert_eq!(result.kind, "teleport");
        assert!(context.history.is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_wait_fails_the_step() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        for seconds in [1e20, -1.0, f64::NAN] {
            let result = executor
                .execute(&Step::new(StepKind::Wait { seconds }), 0, &mut context)
                .await;
            assert!(!result.success);
            assert!(result.error.as_deref().unwrap_or_default().contains("invalid wait"));
        }

        let result = executor
            .execute(&Step::new(StepKind::Wait { seconds: 0.0 }), 1, &mut context)
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn expected_action_is_reported() {
        let executor = executor(Arc::new(RecordingClient::default()));
        let mut context = context();
        let mut step = Step::text("weather?");
        step.expected_action = Some("weather_lookup".into());

        let result = executor.execute(&step, 0, &mut context).await;
        assert_eq!(result.expected_action.as_deref(), Some("weather_lookup"));
    }

    #[tokio::test]
    async fn slow_replies_time_out() {
        let executor = executor(Arc::new(SlowClient)).with_step_timeout(Duration::from_millis(20));
        let mut context = context();
        let result = executor.execute(&Step::text("hi"), 0, &mut context).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("timed out"));
        assert_eq!(context.history.len(), 1);
    }
}

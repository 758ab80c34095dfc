use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use dialog_harness::{
    eval::{
        executor::ActionRunner,
        scenario::{Assertion, AssertionKind, Step, StepKind},
    },
    load_scenarios,
    providers::{openai::OpenAI, scripted::ScriptedProvider},
    AssistantClient, ClientError, Credentials, CriterionEvaluator, HttpAssistantClient, LLMProvider,
    ResponseBundle, RetryPolicy, Scenario, ScenarioOrchestrator, Session, Verdict,
};
use serde_json::{json, Value};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join("scenarios")
}

/// Replies `"echo: <message>"` and counts what it was sent.
#[derive(Default)]
struct EchoClient {
    reject_login: bool,
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl AssistantClient for EchoClient {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, ClientError> {
        if self.reject_login {
            return Err(ClientError::Authentication("invalid credentials".into()));
        }
        Ok(Session::new("token"))
    }

    async fn send_text(&self, _session: &Session, message: &str) -> Result<ResponseBundle, ClientError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.to_string());
        }
        Ok(ResponseBundle::text(format!("echo: {message}")))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

fn credentials() -> Credentials {
    Credentials::new("qa@example.com", "secret")
}

fn three_steps_two_passing() -> Scenario {
    Scenario::new("partial", "Two of three steps pass")
        .with_step(Step::text("one").with_assertion(Assertion::contains("one")))
        .with_step(Step::text("two").with_assertion(Assertion::contains("two")))
        .with_step(Step::text("three").with_assertion(Assertion::contains("missing")))
}

fn judge(provider: Arc<dyn LLMProvider>) -> Arc<CriterionEvaluator> {
    Arc::new(CriterionEvaluator::new(provider, "judge").with_retry(RetryPolicy::none()))
}

#[tokio::test]
async fn two_of_three_steps_without_evaluation_fails_locally() {
    let mut orchestrator = ScenarioOrchestrator::new(Arc::new(EchoClient::default()), None, credentials());
    let report = orchestrator.run(&[three_steps_two_passing()]).await;

    let result = &report.results[0];
    assert_eq!(result.passed_steps, 2);
    assert_eq!(result.failed_steps, 1);
    assert!((result.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(result.verdict, Verdict::LocalSteps);
    assert!(!result.success);
    assert!(!report.passed);
    assert_eq!(report.summary.total_steps, 3);
}

#[tokio::test]
async fn scenario_without_steps_fails() {
    let mut orchestrator = ScenarioOrchestrator::new(Arc::new(EchoClient::default()), None, credentials());
    let report = orchestrator.run(&[Scenario::new("empty", "no steps")]).await;

    let result = &report.results[0];
    assert_eq!(result.success_rate, 0.0);
    assert_eq!(result.verdict, Verdict::LocalSteps);
    assert!(!result.success);
    assert!(!report.passed);
    assert!(report.transcripts.is_empty());
}

struct BrokenActions;

#[async_trait]
impl ActionRunner for BrokenActions {
    async fn run_action(&self, action: &str) -> Result<Value, String> {
        Err(format!("{action} is not wired up"))
    }
}

#[tokio::test]
async fn action_runner_failures_are_step_failures() {
    let scenario = Scenario::new("restart", "Restart then talk")
        .with_step(Step::new(StepKind::Restart))
        .with_step(Step::text("still there?"));

    let mut orchestrator = ScenarioOrchestrator::new(Arc::new(EchoClient::default()), None, credentials())
        .with_actions(Arc::new(BrokenActions));
    let report = orchestrator.run(&[scenario]).await;

    let result = &report.results[0];
    assert!(!result.steps[0].success);
    assert!(result.steps[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("restart_gaja is not wired up"));
    assert!(result.steps[1].success);
    assert_eq!(result.success_rate, 0.5);
}

#[tokio::test]
async fn report_carries_transcripts_of_this_run_only() {
    let mut orchestrator = ScenarioOrchestrator::new(Arc::new(EchoClient::default()), None, credentials());

    let first = orchestrator
        .run(&[Scenario::new("greeting", "Says hi").with_step(Step::text("hi"))])
        .await;
    assert_eq!(first.transcripts.len(), 1);
    assert!(first.transcripts["greeting"].contains("USER: hi\nASSISTANT: echo: hi"));

    let second = orchestrator
        .run(&[Scenario::new("farewell", "Says bye").with_step(Step::text("bye"))])
        .await;
    assert_eq!(second.transcripts.keys().collect::<Vec<_>>(), vec!["farewell"]);
    assert!(orchestrator.histories().get("greeting").is_none());
}

#[tokio::test]
async fn unreachable_grader_falls_back_to_step_rule() {
    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::new("http://127.0.0.1:9/v1").expect("provider"));
    let scenario = Scenario::new("reachable", "All steps pass")
        .with_step(Step::text("hello").with_assertion(Assertion::contains("hello")));

    let mut orchestrator = ScenarioOrchestrator::new(
        Arc::new(EchoClient::default()),
        Some(judge(provider)),
        credentials(),
    );
    let report = orchestrator.run(&[scenario]).await;

    let result = &report.results[0];
    assert!(result.conversation_evaluation.is_none());
    assert!(result
        .evaluation_error
        .as_deref()
        .unwrap_or_default()
        .contains("grading backend unavailable"));
    assert_eq!(result.verdict, Verdict::LocalSteps);
    assert!(result.success);
    assert_eq!(report.summary.errors, 1);
}

#[tokio::test]
async fn empty_history_skips_grading() {
    let provider = Arc::new(ScriptedProvider::new(vec!["judge".into()]).with_fallback(r#"{"score": 10}"#));
    let scenario = Scenario::new("actions_only", "No conversation at all")
        .with_step(Step::new(StepKind::Action {
            action: "restart_gaja".into(),
        }))
        .with_step(Step::new(StepKind::Wait { seconds: 0.0 }));

    let mut orchestrator = ScenarioOrchestrator::new(
        Arc::new(EchoClient::default()),
        Some(judge(provider.clone())),
        credentials(),
    );
    let report = orchestrator.run(&[scenario]).await;

    let result = &report.results[0];
    assert!(provider.requests().is_empty());
    assert!(result.conversation_evaluation.is_none());
    assert!(result.evaluation_error.is_none());
    assert_eq!(result.verdict, Verdict::LocalSteps);
    assert!(result.success);
}

#[tokio::test]
async fn failed_login_aborts_without_running_steps() {
    let client = Arc::new(EchoClient {
        reject_login: true,
        ..EchoClient::default()
    });
    let mut orchestrator = ScenarioOrchestrator::new(client.clone(), None, credentials());
    let report = orchestrator.run(&[three_steps_two_passing()]).await;

    let result = &report.results[0];
    assert_eq!(result.verdict, Verdict::Aborted);
    assert!(!result.success);
    assert!(result.steps.is_empty());
    assert!(result.error.as_deref().unwrap_or_default().contains("invalid credentials"));
    assert!(client.sent.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn graded_conversation_decides_by_quality_gate() {
    let provider = Arc::new(
        ScriptedProvider::new(vec!["judge".into()])
            .with_fallback(r#"{"score": 9, "reasoning": "good", "comments": "fine", "severity": "low"}"#),
    );
    let scenario = Scenario::new("graded", "Greeting")
        .with_expected_behavior("Greets back")
        .with_step(
            Step::text("hello")
                .with_assertion(Assertion::new(AssertionKind::SemanticOk).with_value("greets back")),
        );

    let log_dir = tempfile::tempdir().expect("tempdir");
    let mut orchestrator = ScenarioOrchestrator::new(
        Arc::new(EchoClient::default()),
        Some(judge(provider.clone())),
        credentials(),
    )
    .with_log_dir(Some(log_dir.path().to_path_buf()));
    let report = orchestrator.run(&[scenario]).await;

    let result = &report.results[0];
    let evaluation = result.conversation_evaluation.as_ref().expect("evaluation");
    assert_eq!(evaluation.criteria_results.len(), 10);
    assert!((evaluation.success_percentage - 90.0).abs() < 1e-9);
    assert!(evaluation.passes_quality_gate);
    assert_eq!(result.verdict, Verdict::QualityGate);
    assert!(result.success);
    assert!(report.passed);

    // one turn grade, ten criteria, one flow analysis
    assert_eq!(provider.requests().len(), 12);
    assert_eq!(orchestrator.histories().get("graded").map(|h| h.len()), Some(1));

    let logs: Vec<_> = std::fs::read_dir(log_dir.path())
        .expect("log dir")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(logs.len(), 1);
    let body = std::fs::read_to_string(logs[0].path()).expect("log");
    assert!(body.lines().any(|line| line.contains("\"record\":\"evaluation\"")));
}

#[tokio::test]
async fn fixture_scenarios_run_over_http() {
    let mut assistant = mockito::Server::new_async().await;
    assistant
        .mock("POST", "/api/v1/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"success": true, "token": "jwt"}"#)
        .create_async()
        .await;
    assistant
        .mock("POST", "/api/v1/ai/query")
        .match_body(mockito::Matcher::PartialJson(json!({"query": "What's the weather like in Warsaw?"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response": "It is 21C and sunny in Warsaw."}"#)
        .create_async()
        .await;
    assistant
        .mock("POST", "/api/v1/ai/query")
        .match_body(mockito::Matcher::PartialJson(json!({"query": "And tomorrow?"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response": {"text": "Tomorrow Warsaw expects light rain."}}"#)
        .create_async()
        .await;
    assistant
        .mock("POST", "/api/v1/ai/query")
        .match_body(mockito::Matcher::PartialJson(json!({"query": "Hello!"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response": "Hello! How can I help?"}"#)
        .create_async()
        .await;

    let mut grader = mockito::Server::new_async().await;
    grader
        .mock("GET", "/v1/models")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": [{"id": "judge"}]}"#)
        .create_async()
        .await;
    grader
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"choices": [{"message": {"role": "assistant", "content": "{\"score\": 8, \"comments\": \"fine\", \"severity\": \"low\"}"}}]}"#,
        )
        .expect_at_least(1)
        .create_async()
        .await;

    let scenarios = load_scenarios(fixtures()).expect("fixtures");
    let names: Vec<_> = scenarios.iter().map(Scenario::name).collect();
    assert_eq!(names, vec!["smalltalk_greeting", "weather_followup"]);

    let client = HttpAssistantClient::new(assistant.url(), Duration::from_secs(5))
        .expect("client")
        .with_retry(RetryPolicy::none());
    let provider: Arc<dyn LLMProvider> =
        Arc::new(OpenAI::new(format!("{}/v1", grader.url())).expect("provider"));

    let mut orchestrator = ScenarioOrchestrator::new(Arc::new(client), Some(judge(provider)), credentials());
    let report = orchestrator.run(&scenarios).await;

    assert_eq!(report.summary.scenarios, 2);
    assert_eq!(report.summary.total_steps, 4);
    assert_eq!(report.summary.passed_steps, 4);
    for result in &report.results {
        let evaluation = result.conversation_evaluation.as_ref().expect("evaluation");
        assert!((evaluation.success_percentage - 80.0).abs() < 1e-9);
        assert_eq!(result.verdict, Verdict::QualityGate);
        assert!(result.success, "{} should pass", result.name);
    }
    assert!(report.passed);
}

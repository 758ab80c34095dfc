use std::{path::PathBuf, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    client::{AssistantClient, Credentials},
    config::HarnessConfig,
    eval::{
        assertions::AssertionVerifier,
        executor::{ActionRunner, StepExecutor},
        report::{RunReport, ScenarioResult, Verdict},
        scenario::Scenario,
    },
    history::{ConversationHistory, HistoryStore, ScenarioContext},
    judge::{CriterionEvaluator, QualityGate, SuccessPolicy},
    run_log::RunLog,
};

/// Drives scenarios end to end: login, steps, grading, verdict.
pub struct ScenarioOrchestrator {
    executor: StepExecutor,
    evaluator: Option<Arc<CriterionEvaluator>>,
    credentials: Credentials,
    gate: QualityGate,
    policy: SuccessPolicy,
    min_pass_fraction: f64,
    log_dir: Option<PathBuf>,
    histories: HistoryStore,
}

impl ScenarioOrchestrator {
    pub fn new(
        client: Arc<dyn AssistantClient>,
        evaluator: Option<Arc<CriterionEvaluator>>,
        credentials: Credentials,
    ) -> Self {
        let verifier = AssertionVerifier::new(evaluator.clone());
        Self {
            executor: StepExecutor::new(client, verifier),
            evaluator,
            credentials,
            gate: QualityGate::default(),
            policy: SuccessPolicy::default(),
            min_pass_fraction: 0.5,
            log_dir: None,
            histories: HistoryStore::new(),
        }
    }

    /// Wires thresholds, timeouts and the log directory from a loaded config.
    pub fn from_config(
        config: &HarnessConfig,
        client: Arc<dyn AssistantClient>,
        evaluator: Option<Arc<CriterionEvaluator>>,
    ) -> Self {
        let verifier = AssertionVerifier::new(evaluator.clone())
            .with_thresholds(config.gate.semantic_threshold, config.gate.effect_threshold);
        let executor = StepExecutor::new(client, verifier)
            .with_step_timeout(config.target.step_timeout())
            .with_between_steps(config.runtime.between_steps());

        Self {
            executor,
            evaluator,
            credentials: Credentials::new(config.target.email.clone(), config.target.password.clone()),
            gate: QualityGate::new(config.gate.quality_threshold),
            policy: SuccessPolicy {
                score_floor: config.gate.score_floor,
                local_step_threshold: config.gate.local_step_threshold,
            },
            min_pass_fraction: config.gate.min_pass_fraction,
            log_dir: Some(config.runtime.log_dir.clone()),
            histories: HistoryStore::new(),
        }
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionRunner>) -> Self {
        self.executor = self.executor.with_actions(actions);
        self
    }

    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Self {
        self.log_dir = log_dir;
        self
    }

    pub fn histories(&self) -> &HistoryStore {
        &self.histories
    }

    /// Runs every scenario in order and builds the run report.
    ///
    /// Each call starts from an empty history store; the report carries the
    /// transcripts archived during this run.
    pub async fn run(&mut self, scenarios: &[Scenario]) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.histories = HistoryStore::new();

        let mut log = match self.log_dir.as_ref().map(RunLog::create) {
            Some(Ok(log)) => {
                info!(path = %log.path().display(), "writing run log");
                Some(log)
            }
            Some(Err(err)) => {
                warn!(error = %err, "run log unavailable, continuing without it");
                None
            }
            None => None,
        };

        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let (result, history) = self.run_scenario(scenario, log.as_mut()).await;
            self.histories.archive(scenario.name(), history);
            results.push(result);
        }

        let report = RunReport::new(
            started_at,
            results,
            clock.elapsed().as_secs_f64(),
            self.min_pass_fraction,
        )
        .with_transcripts(self.histories.transcripts());
        info!(
            scenarios = report.summary.scenarios,
            passed = report.summary.passed_scenarios,
            failed = report.summary.failed_scenarios,
            run_passed = report.passed,
            "run finished"
        );
        report
    }

    /// Runs one scenario and hands back its result plus the recorded conversation.
    pub async fn run_scenario(
        &self,
        scenario: &Scenario,
        mut log: Option<&mut RunLog>,
    ) -> (ScenarioResult, ConversationHistory) {
        let started_at = Utc::now();
        let name = scenario.name();
        info!(scenario = %name, steps = scenario.steps.len(), "scenario started");

        let session = match self.executor.client().authenticate(&self.credentials).await {
            Ok(session) => session,
            Err(err) => {
                let message = err.to_string();
                error!(scenario = %name, error = %message, "authentication failed, scenario aborted");
                if let Some(log) = log.as_deref_mut() {
                    if let Err(err) = log.error(name, None, &message) {
                        warn!(error = %err, "failed to write run log");
                    }
                }
                let result = ScenarioResult {
                    name: name.to_string(),
                    tags: scenario.meta.tags.clone(),
                    steps: Vec::new(),
                    passed_steps: 0,
                    failed_steps: 0,
                    success_rate: 0.0,
                    conversation_evaluation: None,
                    evaluation_error: None,
                    verdict: Verdict::Aborted,
                    success: false,
                    error: Some(message),
                    started_at,
                    finished_at: Utc::now(),
                };
                return (result, ConversationHistory::new());
            }
        };

        let mut context = ScenarioContext::new(name, session);
        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let result = self.executor.execute(step, index, &mut context).await;
            if let Some(log) = log.as_deref_mut() {
                if let Err(err) = log.step(name, &result) {
                    warn!(error = %err, "failed to write run log");
                }
            }
            steps.push(result);
        }

        let passed_steps = steps.iter().filter(|step| step.success).count();
        let success_rate = ScenarioResult::step_success_rate(&steps);
        let history = context.into_history();

        let (evaluation, evaluation_error) = match (&self.evaluator, history.is_empty()) {
            (Some(evaluator), false) => {
                match evaluator.evaluate_conversation(scenario, &history, &self.gate).await {
                    Ok(evaluation) => {
                        if let Some(log) = log.as_deref_mut() {
                            if let Err(err) = log.evaluation(name, &evaluation) {
                                warn!(error = %err, "failed to write run log");
                            }
                        }
                        (Some(evaluation), None)
                    }
                    Err(err) => {
                        error!(scenario = %name, error = %err, "conversation evaluation failed, using step results");
                        if let Some(log) = log.as_deref_mut() {
                            if let Err(err) = log.error(name, None, &err.to_string()) {
                                warn!(error = %err, "failed to write run log");
                            }
                        }
                        (None, Some(err.to_string()))
                    }
                }
            }
            (Some(_), true) => {
                info!(scenario = %name, "no conversation recorded, skipping evaluation");
                (None, None)
            }
            (None, _) => (None, None),
        };

        let (success, verdict) = self.policy.decide(evaluation.as_ref(), success_rate);
        info!(
            scenario = %name,
            passed_steps,
            total_steps = steps.len(),
            success_rate,
            verdict = ?verdict,
            success,
            "scenario finished"
        );

        let result = ScenarioResult {
            name: name.to_string(),
            tags: scenario.meta.tags.clone(),
            failed_steps: steps.len() - passed_steps,
            passed_steps,
            steps,
            success_rate,
            conversation_evaluation: evaluation,
            evaluation_error,
            verdict,
            success,
            error: None,
            started_at,
            finished_at: Utc::now(),
        };
        (result, history)
    }
}

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use dialog_harness::{
    eval::scenario::{scenario_schema, ScenarioLoader},
    providers::openai::{OpenAI, OpenAIConfig},
    AssistantClient, CriterionEvaluator, HarnessConfig, HttpAssistantClient, LLMProvider,
    ScenarioOrchestrator,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "e2e-runner")]
#[command(about = "Replay conversation scenarios against an assistant and grade them with an LLM")]
struct Args {
    /// Harness config (YAML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario file or directory (YAML/JSON)
    #[arg(long, default_value = "scenarios")]
    scenarios: PathBuf,

    /// Run only scenarios whose name contains this value or that carry it as a tag (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Output path for the JSON report
    #[arg(long)]
    out: Option<PathBuf>,

    /// Directory for the JSONL run log (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Judge scenarios by step results only
    #[arg(long)]
    skip_evaluation: bool,

    /// Fraction of scenarios that must pass (overrides config)
    #[arg(long)]
    min_pass_fraction: Option<f64>,

    /// Print the scenario JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Do not check the assistant's health endpoint before running
    #[arg(long)]
    skip_health_check: bool,
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("results/{ts}.json"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dialog_harness=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.print_schema {
        println!("{}", serde_json::to_string_pretty(&scenario_schema())?);
        return Ok(());
    }

    let mut config = match args.config.as_ref() {
        Some(path) => HarnessConfig::load(path)?,
        None => {
            let mut config = HarnessConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(fraction) = args.min_pass_fraction {
        config.gate.min_pass_fraction = fraction;
    }
    if let Some(log_dir) = args.log_dir.clone() {
        config.runtime.log_dir = log_dir;
    }

    let scenarios: Vec<_> = ScenarioLoader::new()?
        .load(&args.scenarios)?
        .into_iter()
        .filter(|scenario| scenario.matches(&args.filter))
        .collect();
    if scenarios.is_empty() {
        eprintln!("No scenarios matched.");
        std::process::exit(2);
    }

    let client: Arc<dyn AssistantClient> = Arc::new(
        HttpAssistantClient::new(config.target.base_url.clone(), config.target.request_timeout())?
            .with_retry(config.runtime.retry.clone())
            .with_conversation_id(config.target.conversation_id.clone()),
    );

    if !args.skip_health_check && !client.health_check().await {
        eprintln!("Assistant at {} is not healthy.", config.target.base_url);
        std::process::exit(1);
    }

    let evaluator = if args.skip_evaluation || !config.grader.enabled {
        None
    } else {
        let mut grader = OpenAIConfig::new(config.grader.base_url.clone())
            .with_timeout(config.grader.request_timeout());
        if let Some(key) = config.grader.api_key.clone() {
            grader = grader.with_api_key(key);
        }
        let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_config(grader)?);
        Some(Arc::new(CriterionEvaluator::from_config(
            provider,
            &config.grader,
            config.runtime.retry.clone(),
        )))
    };

    let mut orchestrator = ScenarioOrchestrator::from_config(&config, client, evaluator);
    let report = orchestrator.run(&scenarios).await;

    let out_path = args.out.unwrap_or_else(default_out_path);
    report.write_json(&out_path)?;

    for result in &report.results {
        let score = result
            .conversation_evaluation
            .as_ref()
            .map(|evaluation| format!("{:.1}%", evaluation.success_percentage))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{} {} (steps {}/{}, score {}, verdict {:?})",
            if result.success { "PASS" } else { "FAIL" },
            result.name,
            result.passed_steps,
            result.steps.len(),
            score,
            result.verdict,
        );
        if let Some(error) = result.error.as_ref().or(result.evaluation_error.as_ref()) {
            println!("  - {error}");
        }
    }

    let summary = &report.summary;
    println!(
        "Scenarios: {}/{} passed, Steps: {}/{} passed, Errors: {}, Elapsed: {:.1}s, Report: {}",
        summary.passed_scenarios,
        summary.scenarios,
        summary.passed_steps,
        summary.total_steps,
        summary.errors,
        summary.elapsed_secs,
        out_path.display()
    );

    if report.passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

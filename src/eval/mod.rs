pub mod assertions;
pub mod executor;
pub mod report;
pub mod runner;
pub mod scenario;

pub use assertions::{grade_effect, AssertionOutcome, AssertionVerifier};
pub use executor::{ActionRunner, SimulatedActions, StepExecutor};
pub use report::{RunReport, RunSummary, ScenarioResult, StepResult, Verdict};
pub use runner::ScenarioOrchestrator;
pub use scenario::{
    load_scenarios, scenario_schema, Assertion, AssertionKind, AssertionTarget, Scenario, ScenarioError,
    ScenarioLoader, Step, StepKind,
};

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    eval::{assertions::AssertionOutcome, report::StepResult},
    judge::ConversationEvaluation,
};

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RunRecord<'a> {
    Step {
        ts: DateTime<Utc>,
        scenario: &'a str,
        step_idx: usize,
        kind: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_action: Option<&'a str>,
        success: bool,
        input: &'a Value,
        output: &'a Value,
        assertions: &'a [AssertionOutcome],
    },
    Error {
        ts: DateTime<Utc>,
        scenario: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_idx: Option<usize>,
        message: &'a str,
    },
    Evaluation {
        ts: DateTime<Utc>,
        scenario: &'a str,
        evaluation: &'a ConversationEvaluation,
    },
}

/// Line-delimited JSON log of a single run.
pub struct RunLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunLog {
    /// Creates `test_run_<timestamp>.jsonl` inside `dir`.
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        Self::create_at(dir.join(format!("test_run_{ts}.jsonl")))
    }

    pub fn create_at(path: PathBuf) -> io::Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, record: &RunRecord<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn step(&mut self, scenario: &str, step: &StepResult) -> io::Result<()> {
        self.write(&RunRecord::Step {
            ts: step.started_at,
            scenario,
            step_idx: step.index,
            kind: &step.kind,
            expected_action: step.expected_action.as_deref(),
            success: step.success,
            input: &step.input,
            output: &step.output,
            assertions: &step.assertions,
        })?;

        match step.error.as_deref() {
            Some(message) => self.error(scenario, Some(step.index), message),
            None => Ok(()),
        }
    }

    pub fn error(&mut self, scenario: &str, step_idx: Option<usize>, message: &str) -> io::Result<()> {
        self.write(&RunRecord::Error {
            ts: Utc::now(),
            scenario,
            step_idx,
            message,
        })
    }

    pub fn evaluation(&mut self, scenario: &str, evaluation: &ConversationEvaluation) -> io::Result<()> {
        self.write(&RunRecord::Evaluation {
            ts: Utc::now(),
            scenario,
            evaluation,
        })
    }
}

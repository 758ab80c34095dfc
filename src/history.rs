use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnResponse {
    Reply {
        text: String,
        #[serde(default)]
        raw: Value,
    },
    Failed {
        error: String,
    },
}

impl TurnResponse {
    pub fn text(&self) -> Option<&str> {
        match self {
            TurnResponse::Reply { text, .. } => Some(text),
            TurnResponse::Failed { .. } => None,
        }
    }
}

/// One user query and whatever came back for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: TurnResponse,
    pub timestamp: DateTime<Utc>,
    pub step_index: usize,
}

impl ConversationTurn {
    pub fn reply(step_index: usize, query: impl Into<String>, text: impl Into<String>, raw: Value) -> Self {
        Self {
            query: query.into(),
            response: TurnResponse::Reply {
                text: text.into(),
                raw,
            },
            timestamp: Utc::now(),
            step_index,
        }
    }

    pub fn failed(step_index: usize, query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: TurnResponse::Failed { error: error.into() },
            timestamp: Utc::now(),
            step_index,
        }
    }
}

/// Ordered, append-only record of one scenario's conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn append(&mut self, other: ConversationHistory) {
        self.turns.extend(other.turns);
    }

    /// Plain-text transcript handed to the grader.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for (index, turn) in self.turns.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            out.push_str(&format!("=== TURN {} ===\n", index + 1));
            out.push_str(&format!("USER: {}\n", turn.query));
            match &turn.response {
                TurnResponse::Reply { text, .. } => {
                    out.push_str(&format!("ASSISTANT: {text}\n"));
                }
                TurnResponse::Failed { error } => {
                    out.push_str(&format!("ASSISTANT: [no response: {error}]\n"));
                }
            }
        }
        out
    }
}

/// Histories of finished scenarios, keyed by scenario name.
///
/// Entries only grow; a second scenario with an existing name appends its
/// turns to the earlier entry.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    histories: HashMap<String, ConversationHistory>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archive(&mut self, scenario: impl Into<String>, history: ConversationHistory) {
        self.histories
            .entry(scenario.into())
            .or_default()
            .append(history);
    }

    pub fn get(&self, scenario: &str) -> Option<&ConversationHistory> {
        self.histories.get(scenario)
    }

    /// Rendered transcript of every archived scenario, ordered by name.
    pub fn transcripts(&self) -> BTreeMap<String, String> {
        self.histories
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(name, history)| (name.clone(), history.transcript()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

/// Per-scenario state owned by the orchestrator for the duration of one run.
#[derive(Debug)]
pub struct ScenarioContext {
    pub scenario_name: String,
    pub session: Session,
    pub history: ConversationHistory,
}

impl ScenarioContext {
    pub fn new(scenario_name: impl Into<String>, session: Session) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            session,
            history: ConversationHistory::new(),
        }
    }

    pub fn into_history(self) -> ConversationHistory {
        self.history
    }
}

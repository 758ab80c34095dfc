use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{history::ConversationHistory, judge::criteria::CriterionSpec};

pub const SYSTEM_PROMPT: &str = "You are a strict, impartial grader of conversational assistants. \
Judge only what is present in the transcript. Reply with a single JSON object and nothing else.";

pub const SCORE_BANDS: [(&str, &str); 5] = [
    ("0-2", "catastrophic: wrong, harmful or entirely missing"),
    ("3-4", "very poor: major errors, the user is not helped"),
    ("5-6", "poor: partially helpful with clear gaps"),
    ("7-8", "average: correct and useful with minor flaws"),
    ("9-10", "excellent: fully correct, complete and natural"),
];

const CRITERION_TEMPLATE: &str = r#"Evaluate the conversation below on a single criterion: {{title}}.

SCENARIO
{{scenario}}
{{#if expected_behaviors}}

EXPECTED BEHAVIORS
{{#each expected_behaviors}}
- {{this}}
{{/each}}
{{/if}}

WHAT TO CHECK
{{#each focus}}
- {{this}}
{{/each}}

SCORING SCALE (0-{{max_score}})
{{#each bands}}
- {{this.range}}: {{this.meaning}}
{{/each}}

CONVERSATION
{{transcript}}

Respond with JSON only, in exactly this shape:
{"score": <number 0-{{max_score}}>, "max_score": {{max_score}}, "reasoning": "<why>", "issues": ["<problem>"], "suggestions": ["<improvement>"], "severity": "low|medium|high|critical"}
Use severity "critical" only when the assistant failed the user in a way that must block release."#;

const FLOW_TEMPLATE: &str = r#"Analyse the flow of the conversation below for the scenario "{{scenario}}".
Comment on coherence between turns, how context was carried forward and where the dialogue broke down.
Answer in a few short paragraphs of plain text.

CONVERSATION
{{transcript}}"#;

const TURN_TEMPLATE: &str = r#"A user said:
{{query}}

The assistant replied:
{{reply}}

Expected: {{expectation}}

Rate from 0 to 10 how well the reply satisfies the expectation.
Respond with JSON only: {"score": <number 0-10>, "comments": "<one sentence>"}"#;

static TEMPLATES: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb
});

#[derive(Serialize)]
struct Band {
    range: &'static str,
    meaning: &'static str,
}

#[derive(Serialize)]
struct CriterionPromptData<'a> {
    title: &'a str,
    scenario: &'a str,
    expected_behaviors: &'a [String],
    focus: &'a [String],
    max_score: String,
    bands: Vec<Band>,
    transcript: String,
}

pub fn criterion_prompt(
    spec: &CriterionSpec,
    scenario: &str,
    expected_behaviors: &[String],
    history: &ConversationHistory,
) -> Result<String, handlebars::RenderError> {
    let data = CriterionPromptData {
        title: &spec.title,
        scenario,
        expected_behaviors,
        focus: &spec.focus,
        max_score: format_score(spec.max_score),
        bands: SCORE_BANDS
            .iter()
            .map(|&(range, meaning)| Band { range, meaning })
            .collect(),
        transcript: history.transcript(),
    };
    TEMPLATES.render_template(CRITERION_TEMPLATE, &data)
}

fn format_score(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

pub fn flow_prompt(scenario: &str, history: &ConversationHistory) -> Result<String, handlebars::RenderError> {
    TEMPLATES.render_template(
        FLOW_TEMPLATE,
        &serde_json::json!({
            "scenario": scenario,
            "transcript": history.transcript(),
        }),
    )
}

pub fn turn_prompt(query: &str, reply: &str, expectation: &str) -> Result<String, handlebars::RenderError> {
    TEMPLATES.render_template(
        TURN_TEMPLATE,
        &serde_json::json!({
            "query": query,
            "reply": reply,
            "expectation": expectation,
        }),
    )
}

use std::sync::Arc;

use tracing::warn;

use querypilot_connect::EndpointKind;
use querypilot_memory::MemoryInsights;

use crate::oracle::Oracle;
use crate::plan::{parse_plan, Plan, PlanStep};

const PLANNER_SYSTEM: &str = "You are a query planner for a database agent. \
Reply with JSON ONLY: a single array of step objects, no prose, no code fences. \
Step shapes: \
{\"tool\":\"dbQuery\",\"subQuery\":\"<natural language sub-request>\"} | \
{\"tool\":\"computeStats\",\"onStep\":<index>,\"ops\":[\"count\"|\"topK:<field>:<k>\"|\"mean:<field>\"|\"min:<field>\"|\"max:<field>\"|\"sum:<field>\"|\"distinct:<field>\"]} | \
{\"tool\":\"secondaryAnalysis\",\"onSteps\":[<indices>],\"instructions\":\"<what to explain>\"}. \
Prefer a single dbQuery step. Use computeStats only for numeric follow-ups, \
secondaryAnalysis only when the user asked for interpretation.";

/// What the planner decided for one turn.
pub enum PlanOutcome {
    /// No database work: answer conversationally.
    Conversation { reply: String },
    Plan { plan: Plan, used_oracle: bool },
}

pub struct PlannerInput<'a> {
    pub user_text: &'a str,
    pub schema_json: &'a str,
    pub capabilities: &'a str,
    pub keyword_candidates: &'a [String],
    pub insights: Option<&'a MemoryInsights>,
    pub kind: EndpointKind,
}

/// Emits a plan; never executes. Degrades to a deterministic single-step
/// plan whenever the oracle is absent or unparseable.
pub struct Planner {
    oracle: Option<Arc<dyn Oracle>>,
}

impl Planner {
    pub fn new(oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self { oracle }
    }

    pub async fn plan(&self, input: &PlannerInput<'_>) -> PlanOutcome {
        if let Some(reply) = conversational_reply(input.user_text) {
            return PlanOutcome::Conversation { reply };
        }

        if let Some(oracle) = &self.oracle {
            let prompt = build_prompt(input);
            match oracle.complete(PLANNER_SYSTEM, &prompt).await {
                Ok(raw) => match parse_plan(&raw) {
                    Ok(plan) if !plan.steps.is_empty() => {
                        return PlanOutcome::Plan {
                            plan,
                            used_oracle: true,
                        };
                    }
                    Ok(_) => warn!("planner returned an empty plan, falling back"),
                    Err(e) => warn!("plan parse failed, falling back: {e}"),
                },
                Err(e) => warn!("oracle unavailable for planning, falling back: {e}"),
            }
        }

        PlanOutcome::Plan {
            plan: heuristic_plan(input.user_text),
            used_oracle: false,
        }
    }
}

/// Single dbQuery step carrying the original text; the synthesizer's own
/// heuristics take it from there.
pub fn heuristic_plan(user_text: &str) -> Plan {
    Plan {
        steps: vec![PlanStep::DbQuery {
            sub_query: user_text.to_string(),
        }],
    }
}

fn build_prompt(input: &PlannerInput<'_>) -> String {
    let mut prompt = format!(
        "Database kind: {}\nSchema:\n{}\n",
        input.kind.as_str(),
        input.schema_json
    );
    if !input.capabilities.is_empty() {
        prompt.push_str(&format!("Schema capabilities: {}\n", input.capabilities));
    }
    if !input.keyword_candidates.is_empty() {
        prompt.push_str(&format!(
            "Likely relevant tables/collections: {}\n",
            input.keyword_candidates.join(", ")
        ));
    }
    if let Some(insights) = input.insights {
        prompt.push_str(&format!(
            "User context: skill level {}, {} similar past queries\n",
            insights.skill_level.as_str(),
            insights.similar_queries
        ));
    }
    prompt.push_str(&format!("User request: {}\n", input.user_text));
    prompt
}

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "good morning",
    "good afternoon",
    "good evening",
];

const THANKS: &[&str] = &["thanks", "thank you", "thx", "cheers"];

/// Detect small-talk turns that should never reach a database. Returns
/// the canned reply when matched.
pub fn conversational_reply(text: &str) -> Option<String> {
    let normalized: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalized.is_empty() {
        return None;
    }

    if GREETINGS.contains(&normalized.as_str()) {
        return Some(
            "Hello! Point me at a database and ask about your data in plain language."
                .to_string(),
        );
    }
    if THANKS.contains(&normalized.as_str()) {
        return Some("You're welcome! Happy to dig into more data whenever you are.".to_string());
    }
    if normalized == "how are you" || normalized == "how are you doing" {
        return Some(
            "Doing great and ready to query. What would you like to know about your data?"
                .to_string(),
        );
    }

    // Short greeting-led turns ("hey there") still count as small talk.
    let words: Vec<&str> = normalized.split(' ').collect();
    if words.len() <= 2 && GREETINGS.contains(&words[0]) {
        return Some(
            "Hello! Point me at a database and ask about your data in plain language."
                .to_string(),
        );
    }

    None
}

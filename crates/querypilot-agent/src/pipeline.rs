use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use querypilot_common::{Error, QueryKind, Result};
use querypilot_config::AppConfig;
use querypilot_connect::{ConnectionPool, Endpoint};
use querypilot_memory::{MemoryInsights, MetaStore, NewMemoryRecord};
use querypilot_schema::{keywords, profiler, SchemaPayload, SchemaRegistry};

use crate::executor::{ExecutionReport, Executor, ExecutorContext};
use crate::oracle::Oracle;
use crate::plan::Plan;
use crate::planner::{conversational_reply, Planner, PlannerInput, PlanOutcome};
use crate::response::{AgentResponse, QueryRequest, ResponseShaper, ShaperInput};
use crate::synth::{detect_intent, Synthesizer};

pub const QUERY_MIN_CHARS: usize = 3;
pub const QUERY_MAX_CHARS: usize = 500;

/// One turn end-to-end: schema, hints, plan, gated execution, memory,
/// response. Collaborators are injected once at assembly time.
pub struct AgentPipeline {
    pool: Arc<ConnectionPool>,
    registry: Arc<SchemaRegistry>,
    meta: Arc<MetaStore>,
    planner: Planner,
    executor: Executor,
    shaper: ResponseShaper,
}

impl AgentPipeline {
    pub fn new(
        config: &AppConfig,
        pool: Arc<ConnectionPool>,
        registry: Arc<SchemaRegistry>,
        meta: Arc<MetaStore>,
        oracle: Option<Arc<dyn Oracle>>,
    ) -> Self {
        let planner = Planner::new(oracle.clone());
        let executor = Executor::new(
            Synthesizer::new(oracle.clone()),
            oracle.clone(),
            config.limits.row_cap,
            Duration::from_millis(config.limits.query_timeout_ms),
        );
        let shaper = ResponseShaper::new(oracle, config.safety.redact_sql);
        Self {
            pool,
            registry,
            meta,
            planner,
            executor,
            shaper,
        }
    }

    /// Drive one user turn. Framing errors (bad input, unknown endpoint,
    /// failed connection) abort the request; everything else degrades
    /// into the trace.
    pub async fn handle_turn(
        &self,
        user_id: &str,
        request: &QueryRequest,
        endpoint: &Endpoint,
    ) -> Result<AgentResponse> {
        validate_query_text(&request.query)?;
        let started = Instant::now();
        let db_key = endpoint.db_key();

        // Small talk never touches a database.
        if let Some(reply) = conversational_reply(&request.query) {
            let query_id = self.record_conversation(user_id, &db_key, request);
            return Ok(self
                .shaper
                .shape(ShaperInput {
                    user_text: &request.query,
                    plan: &Plan::default(),
                    outcomes: &[],
                    executed: &[],
                    data: None,
                    succeeded: true,
                    dry_run: request.dry_run,
                    insight: request.insight,
                    insights: None,
                    suggestions: Vec::new(),
                    execution_millis: started.elapsed().as_millis() as u64,
                    query_id,
                })
                .await
                .with_message(reply));
        }

        let handle = self.pool.acquire(endpoint).await?;
        let schema_json = self
            .registry
            .get_or_build(endpoint, &handle, request.refresh_schema)
            .await?;
        let payload = SchemaPayload::from_json(&schema_json)
            .unwrap_or_else(|| SchemaPayload::Relational(Vec::new()));

        let capabilities = profiler::profile(&payload);
        let candidates = keywords::match_candidates(&request.query, &payload);
        let pattern_label = pattern_label(&request.query, &candidates);

        let insights = match self.meta.insights_for(user_id, &db_key, &pattern_label) {
            Ok(insights) => Some(insights),
            Err(e) => {
                warn!("memory insights unavailable: {e}");
                None
            }
        };

        let planner_input = PlannerInput {
            user_text: &request.query,
            schema_json: &schema_json,
            capabilities: &capabilities,
            keyword_candidates: &candidates,
            insights: insights.as_ref(),
            kind: endpoint.kind(),
        };
        let outcome = self.planner.plan(&planner_input).await;

        let plan = match outcome {
            PlanOutcome::Plan { plan, used_oracle } => {
                info!(
                    steps = plan.steps.len(),
                    used_oracle, "plan ready for execution"
                );
                plan
            }
            // The planner re-detects small talk; already handled above.
            PlanOutcome::Conversation { reply } => {
                let query_id = self.record_conversation(user_id, &db_key, request);
                return Ok(self
                    .shaper
                    .shape(ShaperInput {
                        user_text: &request.query,
                        plan: &Plan::default(),
                        outcomes: &[],
                        executed: &[],
                        data: None,
                        succeeded: true,
                        dry_run: request.dry_run,
                        insight: request.insight,
                        insights,
                        suggestions: Vec::new(),
                        execution_millis: started.elapsed().as_millis() as u64,
                        query_id,
                    })
                    .await
                    .with_message(reply));
            }
        };

        let memory_hint = insights.as_ref().map(|i| {
            format!(
                "{} similar past queries, skill {}",
                i.similar_queries,
                i.skill_level.as_str()
            )
        });
        let report = self
            .executor
            .run(
                &plan,
                &ExecutorContext {
                    handle: &handle,
                    endpoint,
                    schema_json: &schema_json,
                    payload: &payload,
                    candidates: &candidates,
                    memory_hint: memory_hint.as_deref(),
                    dry_run: request.dry_run,
                },
            )
            .await;

        let execution_millis = started.elapsed().as_millis() as u64;
        let query_id = if request.dry_run {
            None
        } else {
            self.record_turn(user_id, &db_key, request, &report, &pattern_label, execution_millis)
        };

        let suggestions = build_suggestions(&capabilities, insights.as_ref(), &payload);

        Ok(self
            .shaper
            .shape(ShaperInput {
                user_text: &request.query,
                plan: &plan,
                outcomes: &report.outcomes,
                executed: &report.executed,
                data: report.data,
                succeeded: report.succeeded,
                dry_run: request.dry_run,
                insight: request.insight,
                insights,
                suggestions,
                execution_millis,
                query_id,
            })
            .await)
    }

    /// Store write failures are logged and swallowed; they never mask
    /// the user-visible response.
    fn record_turn(
        &self,
        user_id: &str,
        db_key: &str,
        request: &QueryRequest,
        report: &ExecutionReport,
        pattern_label: &str,
        execution_millis: u64,
    ) -> Option<String> {
        let description = if report.executed.is_empty() {
            "no query executed".to_string()
        } else {
            report
                .executed
                .iter()
                .map(|record| record.description.clone())
                .collect::<Vec<_>>()
                .join("; ")
        };

        let result_count = report
            .data
            .as_ref()
            .and_then(Value::as_array)
            .map(|rows| rows.len() as i64)
            .unwrap_or(0);

        let record = NewMemoryRecord {
            user_id: user_id.to_string(),
            db_key: db_key.to_string(),
            original_text: request.query.clone(),
            query_description: description,
            query_kind: report.last_query_kind.unwrap_or(QueryKind::Read),
            targets: report.targets.clone(),
            execution_millis: execution_millis as i64,
            result_count,
            succeeded: report.succeeded,
            context_tags: Vec::new(),
            pattern_label: pattern_label.to_string(),
        };

        match self.meta.record_turn(&record) {
            Ok((id, _profile)) => Some(id),
            Err(e) => {
                warn!("failed to record turn in memory: {e}");
                None
            }
        }
    }

    fn record_conversation(
        &self,
        user_id: &str,
        db_key: &str,
        request: &QueryRequest,
    ) -> Option<String> {
        if request.dry_run {
            return None;
        }
        let record = NewMemoryRecord {
            user_id: user_id.to_string(),
            db_key: db_key.to_string(),
            original_text: request.query.clone(),
            query_description: "conversational reply".to_string(),
            query_kind: QueryKind::Conversation,
            targets: vec!["n/a".to_string()],
            execution_millis: 0,
            result_count: 0,
            succeeded: true,
            context_tags: Vec::new(),
            pattern_label: "conversation".to_string(),
        };
        match self.meta.record_turn(&record) {
            Ok((id, _)) => Some(id),
            Err(e) => {
                warn!("failed to record conversation turn: {e}");
                None
            }
        }
    }
}

/// Query text bounds: 3..=500 characters, inclusive.
pub fn validate_query_text(text: &str) -> Result<()> {
    let length = text.chars().count();
    if length < QUERY_MIN_CHARS {
        return Err(Error::BadInput(format!(
            "query must be at least {QUERY_MIN_CHARS} characters"
        )));
    }
    if length > QUERY_MAX_CHARS {
        return Err(Error::BadInput(format!(
            "query must be at most {QUERY_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

/// The personalization bucket for this turn: intent keyword plus the
/// best-matching target.
pub fn pattern_label(text: &str, candidates: &[String]) -> String {
    let intent = detect_intent(text).label();
    match candidates.first() {
        Some(target) => format!("{intent}:{target}"),
        None => format!("{intent}:general"),
    }
}

fn build_suggestions(
    capabilities: &str,
    insights: Option<&MemoryInsights>,
    payload: &SchemaPayload,
) -> Vec<String> {
    let mut suggestions = Vec::new();

    if capabilities.contains("top_selling_products") {
        suggestions.push("Which products sold the most in the last 30 days?".to_string());
    }
    if capabilities.contains("revenue_over_time") {
        suggestions.push("How did revenue change over the last 30 days?".to_string());
    }
    if capabilities.contains("activity_over_time") {
        suggestions.push("What happened in the last 7 days?".to_string());
    }
    if capabilities.contains("user_lookup") {
        suggestions.push("Find a user by email address".to_string());
    }

    if let Some(insights) = insights {
        if let Some(frequent) = insights.frequent_collections.first() {
            suggestions.push(format!("Show the latest records from {frequent}"));
        }
    }
    if suggestions.is_empty() {
        if let Some(entity) = payload.entities().first() {
            suggestions.push(format!("How many records are in {}?", entity.name));
        }
    }

    suggestions.truncate(3);
    suggestions
}

trait WithMessage {
    fn with_message(self, message: String) -> Self;
}

impl WithMessage for AgentResponse {
    fn with_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{pattern_label, validate_query_text, QUERY_MAX_CHARS};

    #[test]
    fn query_length_boundaries_are_inclusive() {
        assert!(validate_query_text("abc").is_ok());
        assert!(validate_query_text("ab").is_err());

        let max = "x".repeat(QUERY_MAX_CHARS);
        assert!(validate_query_text(&max).is_ok());

        let over = "x".repeat(QUERY_MAX_CHARS + 1);
        let err = over_error(&over);
        assert_eq!(err, "BadInput");
    }

    fn over_error(text: &str) -> &'static str {
        validate_query_text(text)
            .expect_err("overlong query must be rejected")
            .kind()
    }

    #[test]
    fn pattern_labels_combine_intent_and_target() {
        assert_eq!(
            pattern_label("how many orders", &["orders".to_string()]),
            "count:orders"
        );
        assert_eq!(pattern_label("show me stuff", &[]), "lookup:general");
    }
}

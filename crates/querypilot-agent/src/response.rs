use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use querypilot_memory::MemoryInsights;
use querypilot_safety::ExecutedQuery;

use crate::executor::{ExecutedQueryRecord, StepOutcome};
use crate::oracle::Oracle;
use crate::plan::Plan;

const SUMMARY_SYSTEM: &str = "You summarize database query results for an end user. \
One or two plain sentences. Mention counts when known. Never reply with JSON.";

/// Wire shape of a query request, shared by the HTTP endpoint and the
/// WebSocket `send-message` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub refresh_schema: bool,
    #[serde(default)]
    pub insight: bool,
}

/// Minimal mode carries only data/message/success; verbose (insight)
/// mode adds the rest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    pub data: Value,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<StepOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_queries: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_insights: Option<MemoryInsights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

pub struct ShaperInput<'a> {
    pub user_text: &'a str,
    pub plan: &'a Plan,
    pub outcomes: &'a [StepOutcome],
    pub executed: &'a [ExecutedQueryRecord],
    pub data: Option<Value>,
    pub succeeded: bool,
    pub dry_run: bool,
    pub insight: bool,
    pub insights: Option<MemoryInsights>,
    pub suggestions: Vec<String>,
    pub execution_millis: u64,
    pub query_id: Option<String>,
}

/// Assembles the minimal or verbose response and produces the final
/// natural-language message.
pub struct ResponseShaper {
    oracle: Option<Arc<dyn Oracle>>,
    redact_sql: bool,
}

impl ResponseShaper {
    pub fn new(oracle: Option<Arc<dyn Oracle>>, redact_sql: bool) -> Self {
        Self { oracle, redact_sql }
    }

    pub async fn shape(&self, input: ShaperInput<'_>) -> AgentResponse {
        let message = self.message_for(&input).await;
        let data = match input.data {
            Some(data) if !input.dry_run => data,
            _ => Value::Null,
        };

        if !input.insight {
            return AgentResponse {
                success: true,
                data,
                message,
                plan: None,
                trace: None,
                executed_queries: None,
                memory_insights: None,
                suggestions: None,
                execution_millis: None,
                query: None,
                query_id: input.query_id,
            };
        }

        let executed_queries = input
            .executed
            .iter()
            .map(|record| self.describe_executed(record))
            .collect();

        AgentResponse {
            success: true,
            data,
            message,
            plan: Some(
                serde_json::to_value(input.plan).unwrap_or_else(|_| json!({ "steps": [] })),
            ),
            trace: Some(input.outcomes.to_vec()),
            executed_queries: Some(executed_queries),
            memory_insights: input.insights,
            suggestions: Some(input.suggestions),
            execution_millis: Some(input.execution_millis),
            query: Some(input.user_text.to_string()),
            query_id: input.query_id,
        }
    }

    /// Verbose-mode entry for one executed query. SQL text honors the
    /// redaction flag; parameter values are never echoed.
    fn describe_executed(&self, record: &ExecutedQueryRecord) -> Value {
        match &record.query {
            ExecutedQuery::Document(q) => json!({
                "operation": q.operation.as_str(),
                "description": record.description,
                "collection": q.collection,
                "filter": q.filter,
                "projection": q.projection,
                "sort": q.sort,
                "limit": q.limit,
                "pipeline": q.pipeline,
            }),
            ExecutedQuery::Sql(q) => {
                let sql = if self.redact_sql {
                    "[redacted]".to_string()
                } else {
                    q.sql.clone()
                };
                json!({
                    "operation": q.kind.as_str(),
                    "description": record.description,
                    "sql": sql,
                    "parameterCount": q.parameters.len(),
                    "table": q.table,
                })
            }
        }
    }

    async fn message_for(&self, input: &ShaperInput<'_>) -> String {
        if input.dry_run {
            return "Preview generated successfully".to_string();
        }

        let fallback = default_message(input.outcomes);

        let Some(oracle) = &self.oracle else {
            return fallback;
        };

        let descriptions: Vec<&str> = input
            .executed
            .iter()
            .map(|record| record.description.as_str())
            .collect();
        let recent_outputs: Vec<&Value> = input
            .outcomes
            .iter()
            .rev()
            .take(3)
            .map(|outcome| &outcome.output)
            .collect();

        let prompt = format!(
            "User asked: {}\nQueries run: {}\nRecent tool outputs: {}\nSummarize the result.",
            input.user_text,
            descriptions.join("; "),
            serde_json::to_string(&recent_outputs).unwrap_or_default(),
        );

        match oracle.complete(SUMMARY_SYSTEM, &prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                warn!("summary oracle failed, using deterministic message: {e}");
                fallback
            }
        }
    }
}

/// Deterministic final message: the retrieved-count phrasing, or the
/// step failure explanation when nothing succeeded.
fn default_message(outcomes: &[StepOutcome]) -> String {
    let retrieved = outcomes
        .iter()
        .rev()
        .find(|outcome| outcome.error.is_none() && outcome.kind == "dbQuery")
        .and_then(|outcome| outcome.output.get("resultCount"))
        .and_then(Value::as_i64);

    if let Some(count) = retrieved {
        return format!("Retrieved {count} record(s)");
    }

    match outcomes.iter().find(|outcome| outcome.error.is_some()) {
        Some(failed) => format!(
            "The request could not be completed: {}",
            failed.error.as_deref().unwrap_or("step failed")
        ),
        None => "Done".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{default_message, QueryRequest, ResponseShaper, ShaperInput};
    use crate::executor::{ExecutedQueryRecord, StepOutcome};
    use crate::plan::Plan;
    use querypilot_common::QueryKind;
    use querypilot_safety::{ExecutedQuery, SqlQuery};
    use serde_json::json;

    fn sql_record(sql: &str) -> ExecutedQueryRecord {
        ExecutedQueryRecord {
            description: "sql against orders".to_string(),
            query: ExecutedQuery::Sql(SqlQuery {
                sql: sql.to_string(),
                parameters: vec![json!("secret-value")],
                table: Some("orders".to_string()),
                kind: QueryKind::Sql,
            }),
        }
    }

    fn success_outcome(count: i64) -> StepOutcome {
        StepOutcome {
            step_index: 0,
            kind: "dbQuery".to_string(),
            output: json!({ "resultCount": count, "preview": [] }),
            error: None,
        }
    }

    fn base_input<'a>(
        plan: &'a Plan,
        outcomes: &'a [StepOutcome],
        executed: &'a [ExecutedQueryRecord],
    ) -> ShaperInput<'a> {
        ShaperInput {
            user_text: "show orders",
            plan,
            outcomes,
            executed,
            data: Some(json!([{ "id": 1 }])),
            succeeded: true,
            dry_run: false,
            insight: true,
            insights: None,
            suggestions: vec![],
            execution_millis: 42,
            query_id: Some("q-1".to_string()),
        }
    }

    #[test]
    fn request_parses_with_camel_case_fields() {
        let raw = r#"{"query": "hello", "dbUrl": "mongodb://h/x", "dryRun": true, "insight": true}"#;
        let request: QueryRequest = serde_json::from_str(raw).expect("request should parse");
        assert!(request.dry_run);
        assert!(request.insight);
        assert_eq!(request.db_url.as_deref(), Some("mongodb://h/x"));
    }

    #[tokio::test]
    async fn minimal_mode_hides_the_verbose_fields() {
        let shaper = ResponseShaper::new(None, false);
        let plan = Plan::default();
        let outcomes = vec![success_outcome(3)];
        let executed = vec![sql_record("SELECT * FROM orders LIMIT 10")];
        let mut input = base_input(&plan, &outcomes, &executed);
        input.insight = false;

        let response = shaper.shape(input).await;
        assert!(response.success);
        assert!(response.plan.is_none());
        assert!(response.trace.is_none());
        assert!(response.executed_queries.is_none());
        assert_eq!(response.message, "Retrieved 3 record(s)");
    }

    #[tokio::test]
    async fn verbose_mode_redacts_sql_but_keeps_structure() {
        let shaper = ResponseShaper::new(None, true);
        let plan = Plan::default();
        let outcomes = vec![success_outcome(3)];
        let executed = vec![sql_record("SELECT * FROM orders WHERE id = $1")];
        let input = base_input(&plan, &outcomes, &executed);

        let response = shaper.shape(input).await;
        let queries = response
            .executed_queries
            .expect("verbose mode should include executed queries");
        assert_eq!(queries[0]["sql"], json!("[redacted]"));
        // Parameter values never appear in any mode.
        assert!(queries[0].get("parameters").is_none());
        assert_eq!(queries[0]["parameterCount"], json!(1));
    }

    #[tokio::test]
    async fn dry_run_returns_null_data_and_the_preview_message() {
        let shaper = ResponseShaper::new(None, false);
        let plan = Plan::default();
        let outcomes: Vec<StepOutcome> = vec![];
        let executed = vec![sql_record("SELECT 1")];
        let mut input = base_input(&plan, &outcomes, &executed);
        input.dry_run = true;

        let response = shaper.shape(input).await;
        assert_eq!(response.data, serde_json::Value::Null);
        assert_eq!(response.message, "Preview generated successfully");
    }

    #[test]
    fn failed_turns_explain_the_first_error() {
        let outcomes = vec![StepOutcome {
            step_index: 0,
            kind: "dbQuery".to_string(),
            output: json!("SafetyRejected: DELETE_WITHOUT_WHERE"),
            error: Some("SafetyRejected: DELETE_WITHOUT_WHERE".to_string()),
        }];
        let message = default_message(&outcomes);
        assert!(message.contains("DELETE_WITHOUT_WHERE"));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use querypilot_common::{QueryKind, Result};
use querypilot_connect::{DbHandle, Endpoint, EndpointKind};
use querypilot_safety::{DocumentGate, ExecutedQuery, SqlDialect, SqlGate};
use querypilot_schema::SchemaPayload;

use crate::exec_db::{self, QueryResult};
use crate::oracle::Oracle;
use crate::plan::{Plan, PlanStep, StatOp};
use crate::synth::Synthesizer;

/// Preview bounds: per-step trace rows and rows shown to the analysis
/// oracle.
const TRACE_PREVIEW_ROWS: usize = 10;
const ANALYSIS_PREVIEW_ROWS: usize = 20;

const ANALYSIS_SYSTEM: &str = "You are a data analyst. Given row previews and an \
instruction, answer in plain language, two to four sentences. Never reply with JSON.";

/// Result of one plan step; failures are values here, never propagated.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub kind: String,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A gated query together with its human description, echoed in verbose
/// responses and memory records.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutedQueryRecord {
    pub description: String,
    #[serde(flatten)]
    pub query: ExecutedQuery,
}

/// Everything the pipeline needs to shape the response and update memory.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub outcomes: Vec<StepOutcome>,
    pub executed: Vec<ExecutedQueryRecord>,
    pub data: Option<Value>,
    pub succeeded: bool,
    pub last_query_kind: Option<QueryKind>,
    pub targets: Vec<String>,
}

pub struct ExecutorContext<'a> {
    pub handle: &'a DbHandle,
    pub endpoint: &'a Endpoint,
    pub schema_json: &'a str,
    pub payload: &'a SchemaPayload,
    pub candidates: &'a [String],
    pub memory_hint: Option<&'a str>,
    pub dry_run: bool,
}

/// Runs plan steps in order. A step failure is recorded in the trace and
/// later steps still run; prior successes remain valid.
pub struct Executor {
    synthesizer: Synthesizer,
    oracle: Option<Arc<dyn Oracle>>,
    row_cap: i64,
    statement_deadline: Duration,
}

impl Executor {
    pub fn new(
        synthesizer: Synthesizer,
        oracle: Option<Arc<dyn Oracle>>,
        row_cap: i64,
        statement_deadline: Duration,
    ) -> Self {
        Self {
            synthesizer,
            oracle,
            row_cap,
            statement_deadline,
        }
    }

    pub async fn run(&self, plan: &Plan, ctx: &ExecutorContext<'_>) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut rows_by_step: HashMap<usize, Vec<Value>> = HashMap::new();
        let mut last_data: Option<Value> = None;

        for (index, step) in plan.steps.iter().enumerate() {
            let outcome = match step {
                PlanStep::DbQuery { sub_query } => {
                    self.run_db_query(index, sub_query, ctx, &mut report, &mut rows_by_step)
                        .await
                }
                PlanStep::ComputeStats { on_step, ops } => {
                    run_compute_stats(index, *on_step, ops, &rows_by_step)
                }
                PlanStep::SecondaryAnalysis {
                    on_steps,
                    instructions,
                } => {
                    self.run_secondary_analysis(index, on_steps, instructions, &rows_by_step)
                        .await
                }
            };

            if outcome.error.is_none() {
                last_data = Some(outcome.output.clone());
            }
            report.outcomes.push(outcome);
        }

        // Final data: the last successful dbQuery result wins, otherwise
        // the last step's output.
        report.data = rows_by_step
            .keys()
            .max()
            .and_then(|step| rows_by_step.get(step))
            .map(|rows| Value::Array(rows.clone()))
            .or(last_data);

        report
    }

    async fn run_db_query(
        &self,
        index: usize,
        sub_query: &str,
        ctx: &ExecutorContext<'_>,
        report: &mut ExecutionReport,
        rows_by_step: &mut HashMap<usize, Vec<Value>>,
    ) -> StepOutcome {
        let synthesized = match self
            .synthesizer
            .synthesize(
                sub_query,
                ctx.endpoint.kind(),
                ctx.schema_json,
                ctx.payload,
                ctx.candidates,
                ctx.memory_hint,
            )
            .await
        {
            Ok(synthesized) => synthesized,
            Err(e) => return step_error(index, "dbQuery", e.to_string()),
        };

        let gated = match self.gate(synthesized.query, ctx.endpoint.kind()) {
            Ok(gated) => gated,
            Err(e) => {
                // The attempted kind still matters for the memory record.
                report.last_query_kind = Some(kind_from_text(sub_query));
                return step_error(index, "dbQuery", e.to_string());
            }
        };

        report.last_query_kind = Some(gated.query_kind());
        if let Some(target) = gated.target() {
            if !report.targets.iter().any(|t| t == target) {
                report.targets.push(target.to_string());
            }
        }
        report.executed.push(ExecutedQueryRecord {
            description: synthesized.description.clone(),
            query: gated.clone(),
        });

        if ctx.dry_run {
            return StepOutcome {
                step_index: index,
                kind: "dbQuery".to_string(),
                output: json!({
                    "dryRun": true,
                    "description": synthesized.description,
                }),
                error: None,
            };
        }

        let database = ctx
            .endpoint
            .database_name()
            .unwrap_or_else(|| "test".to_string());
        match exec_db::execute(ctx.handle, &database, &gated, self.statement_deadline).await {
            Ok(QueryResult { rows, count }) => {
                let preview: Vec<Value> = rows.iter().take(TRACE_PREVIEW_ROWS).cloned().collect();
                rows_by_step.insert(index, rows);
                report.succeeded = true;
                StepOutcome {
                    step_index: index,
                    kind: "dbQuery".to_string(),
                    output: json!({
                        "description": synthesized.description,
                        "resultCount": count,
                        "preview": preview,
                    }),
                    error: None,
                }
            }
            Err(e) => step_error(index, "dbQuery", e.to_string()),
        }
    }

    fn gate(&self, query: ExecutedQuery, kind: EndpointKind) -> Result<ExecutedQuery> {
        match query {
            ExecutedQuery::Document(q) => {
                let gate = DocumentGate::new(self.row_cap);
                Ok(ExecutedQuery::Document(gate.validate(q)?))
            }
            ExecutedQuery::Sql(q) => {
                let dialect = match kind {
                    EndpointKind::MySql => SqlDialect::MySql,
                    _ => SqlDialect::Postgres,
                };
                let gate = SqlGate::new(dialect, self.row_cap);
                Ok(ExecutedQuery::Sql(gate.validate(
                    &q.sql,
                    q.parameters,
                    q.table,
                )?))
            }
        }
    }

    async fn run_secondary_analysis(
        &self,
        index: usize,
        on_steps: &[usize],
        instructions: &str,
        rows_by_step: &HashMap<usize, Vec<Value>>,
    ) -> StepOutcome {
        let mut previews = Vec::new();
        for step in on_steps {
            match rows_by_step.get(step) {
                Some(rows) => {
                    let preview: Vec<Value> =
                        rows.iter().take(ANALYSIS_PREVIEW_ROWS).cloned().collect();
                    previews.push(json!({ "step": step, "rows": preview }));
                }
                None => {
                    return step_error(
                        index,
                        "secondaryAnalysis",
                        format!("step {step} produced no rows to analyze"),
                    );
                }
            }
        }

        let analysis = match &self.oracle {
            Some(oracle) => {
                let prompt = format!(
                    "Data previews:\n{}\nInstruction: {}",
                    serde_json::to_string(&previews).unwrap_or_default(),
                    instructions
                );
                match oracle.complete(ANALYSIS_SYSTEM, &prompt).await {
                    Ok(text) => text.trim().to_string(),
                    Err(e) => {
                        warn!("analysis oracle failed, using deterministic summary: {e}");
                        deterministic_analysis(&previews)
                    }
                }
            }
            None => deterministic_analysis(&previews),
        };

        StepOutcome {
            step_index: index,
            kind: "secondaryAnalysis".to_string(),
            output: Value::String(analysis),
            error: None,
        }
    }
}

fn deterministic_analysis(previews: &[Value]) -> String {
    let total: usize = previews
        .iter()
        .filter_map(|p| p.get("rows").and_then(Value::as_array).map(Vec::len))
        .sum();
    format!("Reviewed {total} preview row(s) across {} step(s).", previews.len())
}

fn run_compute_stats(
    index: usize,
    on_step: usize,
    ops: &[StatOp],
    rows_by_step: &HashMap<usize, Vec<Value>>,
) -> StepOutcome {
    let Some(rows) = rows_by_step.get(&on_step) else {
        return step_error(
            index,
            "computeStats",
            format!("step {on_step} produced no rows to aggregate"),
        );
    };

    let mut results = serde_json::Map::new();
    for op in ops {
        results.insert(op.label(), compute_stat(op, rows));
    }

    StepOutcome {
        step_index: index,
        kind: "computeStats".to_string(),
        output: Value::Object(results),
        error: None,
    }
}

fn compute_stat(op: &StatOp, rows: &[Value]) -> Value {
    match op {
        StatOp::Count => Value::from(rows.len()),
        StatOp::TopK { field, k } => {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for row in rows {
                if let Some(value) = row.get(field) {
                    if !value.is_null() {
                        *counts.entry(value_key(value)).or_insert(0) += 1;
                    }
                }
            }
            let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            Value::Array(
                entries
                    .into_iter()
                    .take(*k)
                    .map(|(value, count)| json!({ "value": value, "count": count }))
                    .collect(),
            )
        }
        StatOp::Mean { field } => {
            let numbers = numeric_column(rows, field);
            if numbers.is_empty() {
                Value::Null
            } else {
                let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                serde_json::Number::from_f64(mean)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        StatOp::Min { field } => numeric_column(rows, field)
            .into_iter()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        StatOp::Max { field } => numeric_column(rows, field)
            .into_iter()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        StatOp::Sum { field } => {
            let sum: f64 = numeric_column(rows, field).iter().sum();
            serde_json::Number::from_f64(sum)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        StatOp::Distinct { field } => {
            let mut seen = Vec::new();
            for row in rows {
                if let Some(value) = row.get(field) {
                    if !value.is_null() && !seen.contains(value) {
                        seen.push(value.clone());
                    }
                }
            }
            Value::Array(seen)
        }
    }
}

fn numeric_column(rows: &[Value], field: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| row.get(field))
        .filter_map(Value::as_f64)
        .collect()
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn step_error(index: usize, kind: &str, reason: String) -> StepOutcome {
    StepOutcome {
        step_index: index,
        kind: kind.to_string(),
        output: Value::String(reason.clone()),
        error: Some(reason),
    }
}

/// Best-effort classification of a sub-request whose query never passed
/// the gate, so failed turns still record a meaningful kind.
fn kind_from_text(text: &str) -> QueryKind {
    let lower = text.to_lowercase();
    if lower.contains("delete") || lower.contains("remove") {
        QueryKind::Delete
    } else if lower.contains("update") || lower.contains("change") || lower.contains("set ") {
        QueryKind::Update
    } else if lower.contains("insert") || lower.contains("add ") || lower.contains("create") {
        QueryKind::Insert
    } else if lower.contains("count") || lower.contains("how many") {
        QueryKind::Count
    } else {
        QueryKind::Read
    }
}

#[cfg(test)]
mod tests {
    use super::{compute_stat, kind_from_text, run_compute_stats};
    use crate::plan::StatOp;
    use querypilot_common::QueryKind;
    use serde_json::json;
    use std::collections::HashMap;

    fn rows() -> Vec<serde_json::Value> {
        vec![
            json!({ "city": "lisbon", "price": 10.0 }),
            json!({ "city": "porto", "price": 30.0 }),
            json!({ "city": "lisbon", "price": 20.0 }),
        ]
    }

    #[test]
    fn stats_cover_every_operation() {
        let rows = rows();
        assert_eq!(compute_stat(&StatOp::Count, &rows), json!(3));
        assert_eq!(
            compute_stat(
                &StatOp::Sum {
                    field: "price".to_string()
                },
                &rows
            ),
            json!(60.0)
        );
        assert_eq!(
            compute_stat(
                &StatOp::Mean {
                    field: "price".to_string()
                },
                &rows
            ),
            json!(20.0)
        );
        assert_eq!(
            compute_stat(
                &StatOp::Min {
                    field: "price".to_string()
                },
                &rows
            ),
            json!(10.0)
        );
        assert_eq!(
            compute_stat(
                &StatOp::Max {
                    field: "price".to_string()
                },
                &rows
            ),
            json!(30.0)
        );

        let top = compute_stat(
            &StatOp::TopK {
                field: "city".to_string(),
                k: 1,
            },
            &rows,
        );
        assert_eq!(top, json!([{ "value": "lisbon", "count": 2 }]));

        let distinct = compute_stat(
            &StatOp::Distinct {
                field: "city".to_string(),
            },
            &rows,
        );
        assert_eq!(distinct, json!(["lisbon", "porto"]));
    }

    #[test]
    fn stats_over_a_missing_field_degrade_to_null_or_empty() {
        let rows = rows();
        assert_eq!(
            compute_stat(
                &StatOp::Mean {
                    field: "ghost".to_string()
                },
                &rows
            ),
            serde_json::Value::Null
        );
        assert_eq!(
            compute_stat(
                &StatOp::Distinct {
                    field: "ghost".to_string()
                },
                &rows
            ),
            json!([])
        );
    }

    #[test]
    fn compute_stats_against_a_missing_step_is_a_step_error() {
        let outcome = run_compute_stats(1, 0, &[StatOp::Count], &HashMap::new());
        assert!(outcome.error.is_some());
        assert_eq!(outcome.kind, "computeStats");
    }

    #[test]
    fn failed_turns_still_classify_by_text() {
        assert_eq!(kind_from_text("delete old orders"), QueryKind::Delete);
        assert_eq!(kind_from_text("update the status"), QueryKind::Update);
        assert_eq!(kind_from_text("how many users"), QueryKind::Count);
        assert_eq!(kind_from_text("show me things"), QueryKind::Read);
    }
}

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use querypilot_common::{Error, Result};
use querypilot_connect::EndpointKind;
use querypilot_safety::{DocumentOp, DocumentQuery, ExecutedQuery};
use querypilot_schema::{SchemaEntity, SchemaPayload};

use crate::oracle::{sanitize_json_reply, Oracle};

const SYNTH_SYSTEM: &str = "You translate one natural-language sub-request into a \
single database query. Reply with JSON ONLY, no prose, no code fences. \
For document stores reply: {\"operation\":\"find|findOne|count|aggregate|insertOne|updateOne|deleteOne\",\
\"collection\":\"...\",\"filter\":{},\"projection\":{},\"sort\":{},\"limit\":N,\
\"pipeline\":[],\"document\":{},\"update\":{}} (omit unused fields). \
For SQL reply: {\"sql\":\"...\",\"parameters\":[...],\"table\":\"...\"}. \
Safety rules: one statement only; never DROP, TRUNCATE or ALTER; UPDATE and \
DELETE must have a WHERE clause / specific filter; no $where or $function; \
no $out or $merge stages; use DATE_TODAY, DATE_7_DAYS_AGO, DATE_30_DAYS_AGO \
for relative dates.";

/// A synthesized query before it passes the safety gate.
#[derive(Debug, Clone)]
pub struct SynthesizedQuery {
    pub query: ExecutedQuery,
    pub description: String,
}

/// Rough user intent read off the sub-request text. Also feeds the
/// pattern label recorded in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Count,
    Latest,
    Top(i64),
    Lookup,
}

pub fn detect_intent(text: &str) -> Intent {
    let lower = text.to_lowercase();
    if lower.contains("count") || lower.contains("how many") {
        return Intent::Count;
    }
    if lower.contains("latest") || lower.contains("recent") || lower.contains("newest") {
        return Intent::Latest;
    }
    if let Some(n) = top_n(&lower) {
        return Intent::Top(n);
    }
    Intent::Lookup
}

impl Intent {
    pub fn label(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Latest => "latest",
            Self::Top(_) => "top",
            Self::Lookup => "lookup",
        }
    }
}

fn top_n(lower: &str) -> Option<i64> {
    for marker in ["top ", "first "] {
        if let Some(pos) = lower.find(marker) {
            let digits: String = lower[pos + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<i64>() {
                if n > 0 {
                    return Some(n);
                }
            }
        }
    }
    None
}

pub struct Synthesizer {
    oracle: Option<Arc<dyn Oracle>>,
}

impl Synthesizer {
    pub fn new(oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self { oracle }
    }

    /// Produce an ExecutedQuery for one sub-request, via the oracle when
    /// available, otherwise via read-only heuristics.
    pub async fn synthesize(
        &self,
        sub_query: &str,
        kind: EndpointKind,
        schema_json: &str,
        payload: &SchemaPayload,
        candidates: &[String],
        memory_hint: Option<&str>,
    ) -> Result<SynthesizedQuery> {
        if let Some(oracle) = &self.oracle {
            let prompt = build_prompt(sub_query, kind, schema_json, candidates, memory_hint);
            match oracle.complete(SYNTH_SYSTEM, &prompt).await {
                Ok(raw) => match parse_synthesized(&raw, kind) {
                    Ok(query) => return Ok(query),
                    Err(e) => warn!("query synthesis parse failed, using heuristics: {e}"),
                },
                Err(e) => warn!("oracle unavailable for synthesis, using heuristics: {e}"),
            }
        }

        heuristic_query(sub_query, kind, payload, candidates)
    }
}

fn build_prompt(
    sub_query: &str,
    kind: EndpointKind,
    schema_json: &str,
    candidates: &[String],
    memory_hint: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Database kind: {}\nSchema:\n{}\n",
        kind.as_str(),
        schema_json
    );
    if !candidates.is_empty() {
        prompt.push_str(&format!("Candidate targets: {}\n", candidates.join(", ")));
    }
    if let Some(hint) = memory_hint {
        prompt.push_str(&format!("User history hint: {hint}\n"));
    }
    prompt.push_str(&format!("Sub-request: {sub_query}\n"));
    prompt
}

/// Parse the oracle's JSON into a typed query. Shape errors degrade to
/// the heuristic path at the call site.
fn parse_synthesized(raw: &str, kind: EndpointKind) -> Result<SynthesizedQuery> {
    let sanitized = sanitize_json_reply(raw);
    let value: Value = serde_json::from_str(&sanitized)
        .map_err(|e| Error::PlanParseFailed(format!("synthesized query not JSON: {e}")))?;

    match kind {
        EndpointKind::Document => {
            let operation_raw = value
                .get("operation")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::PlanParseFailed("missing operation".to_string()))?;
            let operation = DocumentOp::parse(operation_raw).map_err(Error::from)?;
            let collection = value
                .get("collection")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::PlanParseFailed("missing collection".to_string()))?
                .to_string();

            let query = DocumentQuery {
                operation,
                collection: collection.clone(),
                filter: value.get("filter").cloned().unwrap_or_else(|| json!({})),
                projection: value.get("projection").filter(|p| p.is_object()).cloned(),
                sort: value.get("sort").filter(|s| s.is_object()).cloned(),
                limit: value.get("limit").and_then(Value::as_i64),
                pipeline: value
                    .get("pipeline")
                    .and_then(Value::as_array)
                    .map(|stages| stages.to_vec()),
                document: value.get("document").filter(|d| d.is_object()).cloned(),
                update: value.get("update").filter(|u| u.is_object()).cloned(),
            };
            let description = format!("{} on {}", operation.as_str(), collection);
            Ok(SynthesizedQuery {
                query: ExecutedQuery::Document(query),
                description,
            })
        }
        EndpointKind::Postgres | EndpointKind::MySql => {
            let sql = value
                .get("sql")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::PlanParseFailed("missing sql".to_string()))?
                .to_string();
            let parameters = value
                .get("parameters")
                .and_then(Value::as_array)
                .map(|p| p.to_vec())
                .unwrap_or_default();
            let table = value
                .get("table")
                .and_then(Value::as_str)
                .map(|t| t.to_string());

            let description = match &table {
                Some(table) => format!("sql against {table}"),
                None => "sql statement".to_string(),
            };
            // The gate classifies and validates; this is the raw form.
            Ok(SynthesizedQuery {
                query: ExecutedQuery::Sql(querypilot_safety::SqlQuery {
                    sql,
                    parameters,
                    table,
                    kind: querypilot_common::QueryKind::Sql,
                }),
                description,
            })
        }
    }
}

/// Deterministic read-only fallback: pick a target from the keyword
/// candidates (else the first schema entity) and map the intent keywords
/// onto a bounded read.
pub fn heuristic_query(
    sub_query: &str,
    kind: EndpointKind,
    payload: &SchemaPayload,
    candidates: &[String],
) -> Result<SynthesizedQuery> {
    let entities = payload.entities();
    let target = candidates
        .first()
        .cloned()
        .or_else(|| entities.first().map(|e| e.name.clone()))
        .ok_or_else(|| Error::Db("no tables or collections detected".to_string()))?;

    let entity = entities.iter().find(|e| e.name == target);
    let intent = detect_intent(sub_query);

    match kind {
        EndpointKind::Document => Ok(document_heuristic(&target, entity, intent)),
        EndpointKind::Postgres | EndpointKind::MySql => {
            Ok(sql_heuristic(&target, entity, intent))
        }
    }
}

fn time_field(entity: Option<&SchemaEntity>) -> Option<String> {
    let entity = entity?;
    entity
        .fields
        .iter()
        .find(|f| {
            let lower = f.to_lowercase();
            lower.contains("created") || lower.contains("date") || lower.contains("timestamp")
        })
        .cloned()
}

fn document_heuristic(
    target: &str,
    entity: Option<&SchemaEntity>,
    intent: Intent,
) -> SynthesizedQuery {
    let base = DocumentQuery {
        operation: DocumentOp::Find,
        collection: target.to_string(),
        filter: json!({}),
        projection: None,
        sort: None,
        limit: None,
        pipeline: None,
        document: None,
        update: None,
    };

    let (query, description) = match intent {
        Intent::Count => (
            DocumentQuery {
                operation: DocumentOp::Count,
                ..base
            },
            format!("count on {target}"),
        ),
        Intent::Latest => {
            let field = time_field(entity).unwrap_or_else(|| "createdAt".to_string());
            (
                DocumentQuery {
                    sort: Some(json!({ field.clone(): -1 })),
                    limit: Some(10),
                    ..base
                },
                format!("find on {target} sorted by {field} (limit 10)"),
            )
        }
        Intent::Top(n) => (
            DocumentQuery {
                sort: Some(json!({ "createdAt": -1 })),
                limit: Some(n),
                ..base
            },
            format!("find on {target} (limit {n})"),
        ),
        Intent::Lookup => (
            DocumentQuery {
                limit: Some(10),
                ..base
            },
            format!("find on {target} (limit 10)"),
        ),
    };

    SynthesizedQuery {
        query: ExecutedQuery::Document(query),
        description,
    }
}

fn sql_heuristic(target: &str, entity: Option<&SchemaEntity>, intent: Intent) -> SynthesizedQuery {
    let (sql, description) = match intent {
        Intent::Count => (
            format!("SELECT COUNT(*) AS count FROM {target}"),
            format!("count on {target}"),
        ),
        Intent::Latest => {
            let field = time_field(entity).unwrap_or_else(|| "created_at".to_string());
            (
                format!("SELECT * FROM {target} ORDER BY {field} DESC LIMIT 10"),
                format!("latest rows from {target} by {field}"),
            )
        }
        Intent::Top(n) => (
            format!("SELECT * FROM {target} LIMIT {n}"),
            format!("first {n} rows from {target}"),
        ),
        Intent::Lookup => (
            format!("SELECT * FROM {target} LIMIT 10"),
            format!("rows from {target} (limit 10)"),
        ),
    };

    SynthesizedQuery {
        query: ExecutedQuery::Sql(querypilot_safety::SqlQuery {
            sql,
            parameters: Vec::new(),
            table: Some(target.to_string()),
            kind: querypilot_common::QueryKind::Sql,
        }),
        description,
    }
}

use serde_json::{Map, Value};
use tracing::debug;

use crate::query::{DocumentOp, DocumentQuery};
use crate::{SafetyViolation, SENSITIVE_FIELDS};

/// Operators that execute server-side JavaScript; never forwarded.
const DANGEROUS_OPERATORS: &[&str] = &["$where", "$function", "$accumulator"];

/// Aggregation stages that write back to storage; never forwarded.
const WRITE_STAGES: &[&str] = &["$out", "$merge"];

/// Validates and rewrites document-store queries before execution.
pub struct DocumentGate {
    row_cap: i64,
}

impl DocumentGate {
    pub fn new(row_cap: i64) -> Self {
        Self { row_cap }
    }

    pub fn validate(&self, mut query: DocumentQuery) -> Result<DocumentQuery, SafetyViolation> {
        reject_dangerous_operators(&query.filter)?;

        if let Some(pipeline) = &query.pipeline {
            for stage in pipeline {
                reject_write_stages(stage)?;
                reject_dangerous_operators(stage)?;
            }
        }
        if let Some(update) = &query.update {
            reject_dangerous_operators(update)?;
        }

        match query.operation {
            DocumentOp::UpdateOne | DocumentOp::DeleteOne => {
                if !is_specific_filter(&query.filter) {
                    return Err(SafetyViolation::EmptyWriteFilter);
                }
            }
            DocumentOp::InsertOne => {
                let has_document = query
                    .document
                    .as_ref()
                    .map(|d| d.is_object())
                    .unwrap_or(false);
                if !has_document {
                    return Err(SafetyViolation::UnsupportedOperation(
                        "insertOne without a document".to_string(),
                    ));
                }
            }
            _ => {}
        }

        // Plain-object updates become an explicit $set.
        if query.operation == DocumentOp::UpdateOne {
            if let Some(update) = query.update.take() {
                query.update = Some(wrap_plain_update(update));
            } else {
                return Err(SafetyViolation::UnsupportedOperation(
                    "updateOne without an update".to_string(),
                ));
            }
        }

        if matches!(query.operation, DocumentOp::Find | DocumentOp::FindOne) {
            query.projection = Some(sanitize_projection(query.projection.take()));
        }

        match query.operation {
            DocumentOp::Find => {
                let requested = query.limit.unwrap_or(self.row_cap);
                query.limit = Some(requested.min(self.row_cap).max(1));
            }
            DocumentOp::Aggregate => {
                let pipeline = query.pipeline.get_or_insert_with(Vec::new);
                cap_pipeline(pipeline, self.row_cap);
            }
            _ => {}
        }

        debug!(
            operation = query.operation.as_str(),
            collection = query.collection,
            "document query passed the gate"
        );
        Ok(query)
    }
}

/// Depth-first scan for forbidden operator keys, including inside arrays.
fn reject_dangerous_operators(value: &Value) -> Result<(), SafetyViolation> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if DANGEROUS_OPERATORS.contains(&key.as_str()) {
                    return Err(SafetyViolation::DangerousOperator(key.clone()));
                }
                reject_dangerous_operators(child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_dangerous_operators(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn reject_write_stages(stage: &Value) -> Result<(), SafetyViolation> {
    if let Value::Object(map) = stage {
        for key in map.keys() {
            if WRITE_STAGES.contains(&key.as_str()) {
                return Err(SafetyViolation::WriteStageForbidden(key.clone()));
            }
        }
    }
    Ok(())
}

/// A write filter must name at least one concrete condition.
fn is_specific_filter(filter: &Value) -> bool {
    match filter {
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

/// `{name: "x"}` becomes `{"$set": {name: "x"}}`; operator-form updates
/// pass through unchanged.
fn wrap_plain_update(update: Value) -> Value {
    match &update {
        Value::Object(map) => {
            let has_operator = map.keys().any(|k| k.starts_with('$'));
            if has_operator {
                update
            } else {
                let mut wrapped = Map::new();
                wrapped.insert("$set".to_string(), update);
                Value::Object(wrapped)
            }
        }
        _ => update,
    }
}

/// Sensitive fields are excluded by default; a caller-supplied projection
/// cannot re-include them.
fn sanitize_projection(projection: Option<Value>) -> Value {
    match projection {
        Some(Value::Object(mut map)) => {
            let inclusive = map
                .iter()
                .any(|(k, v)| k != "_id" && v.as_i64() == Some(1));
            if inclusive {
                map.retain(|k, _| !is_sensitive(k));
                Value::Object(map)
            } else {
                for field in SENSITIVE_FIELDS {
                    map.entry((*field).to_string()).or_insert(Value::from(0));
                }
                Value::Object(map)
            }
        }
        _ => {
            let mut map = Map::new();
            for field in SENSITIVE_FIELDS {
                map.insert((*field).to_string(), Value::from(0));
            }
            Value::Object(map)
        }
    }
}

fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|s| lower.contains(s))
}

/// Ensure every aggregation is bounded: clamp existing `$limit` stages and
/// append one when absent.
fn cap_pipeline(pipeline: &mut Vec<Value>, cap: i64) {
    let mut has_limit = false;
    for stage in pipeline.iter_mut() {
        if let Value::Object(map) = stage {
            if let Some(limit) = map.get_mut("$limit") {
                has_limit = true;
                let requested = limit.as_i64().unwrap_or(cap);
                *limit = Value::from(requested.min(cap));
            }
        }
    }
    if !has_limit {
        let mut stage = Map::new();
        stage.insert("$limit".to_string(), Value::from(cap));
        pipeline.push(Value::Object(stage));
    }
}

#[cfg(test)]
mod tests {
    use super::DocumentGate;
    use crate::query::{DocumentOp, DocumentQuery};
    use serde_json::{json, Value};

    fn gate() -> DocumentGate {
        DocumentGate::new(1000)
    }

    fn base(operation: DocumentOp, collection: &str) -> DocumentQuery {
        DocumentQuery {
            operation,
            collection: collection.to_string(),
            filter: json!({}),
            projection: None,
            sort: None,
            limit: None,
            pipeline: None,
            document: None,
            update: None,
        }
    }

    #[test]
    fn where_operator_is_rejected_even_when_nested() {
        let mut query = base(DocumentOp::Find, "users");
        query.filter = json!({
            "$or": [
                { "age": { "$gt": 30 } },
                { "$where": "this.isAdmin" }
            ]
        });
        let err = gate().validate(query).expect_err("$where must be rejected");
        assert_eq!(err.rule(), "DANGEROUS_OPERATOR");
    }

    #[test]
    fn out_stage_is_rejected() {
        let mut query = base(DocumentOp::Aggregate, "orders");
        query.pipeline = Some(vec![
            json!({ "$match": { "status": "paid" } }),
            json!({ "$out": "stolen" }),
        ]);
        let err = gate().validate(query).expect_err("$out must be rejected");
        assert_eq!(err.rule(), "WRITE_STAGE_FORBIDDEN");
    }

    #[test]
    fn delete_with_empty_filter_is_rejected() {
        let query = base(DocumentOp::DeleteOne, "orders");
        let err = gate()
            .validate(query)
            .expect_err("unfiltered delete must be rejected");
        assert_eq!(err.rule(), "EMPTY_WRITE_FILTER");
    }

    #[test]
    fn update_with_specific_filter_gets_set_wrapped() {
        let mut query = base(DocumentOp::UpdateOne, "users");
        query.filter = json!({ "_id": "5f8d0d55b54764421b7156c3" });
        query.update = Some(json!({ "name": "Ada" }));
        let validated = gate().validate(query).expect("specific update should pass");
        assert_eq!(
            validated.update.expect("update should remain"),
            json!({ "$set": { "name": "Ada" } })
        );
    }

    #[test]
    fn operator_form_updates_pass_through() {
        let mut query = base(DocumentOp::UpdateOne, "users");
        query.filter = json!({ "email": "ada@example.com" });
        query.update = Some(json!({ "$inc": { "logins": 1 } }));
        let validated = gate().validate(query).expect("operator update should pass");
        assert_eq!(
            validated.update.expect("update should remain"),
            json!({ "$inc": { "logins": 1 } })
        );
    }

    #[test]
    fn default_projection_excludes_sensitive_fields() {
        let query = base(DocumentOp::Find, "users");
        let validated = gate().validate(query).expect("find should pass");
        let projection = validated.projection.expect("projection should be injected");
        assert_eq!(projection["password"], json!(0));
        assert_eq!(projection["token"], json!(0));
    }

    #[test]
    fn inclusive_projection_cannot_reintroduce_sensitive_fields() {
        let mut query = base(DocumentOp::Find, "users");
        query.projection = Some(json!({ "name": 1, "password": 1 }));
        let validated = gate().validate(query).expect("find should pass");
        let projection = validated.projection.expect("projection should remain");
        assert_eq!(projection.get("password"), None);
        assert_eq!(projection["name"], json!(1));
    }

    #[test]
    fn find_limit_is_clamped_to_the_cap() {
        let mut query = base(DocumentOp::Find, "events");
        query.limit = Some(50_000);
        let validated = gate().validate(query).expect("find should pass");
        assert_eq!(validated.limit, Some(1000));
    }

    #[test]
    fn find_without_limit_gets_the_cap() {
        let query = base(DocumentOp::Find, "events");
        let validated = gate().validate(query).expect("find should pass");
        assert_eq!(validated.limit, Some(1000));
    }

    #[test]
    fn aggregation_without_limit_gets_one_appended() {
        let mut query = base(DocumentOp::Aggregate, "orders");
        query.pipeline = Some(vec![json!({ "$match": { "status": "paid" } })]);
        let validated = gate().validate(query).expect("aggregate should pass");
        let pipeline = validated.pipeline.expect("pipeline should remain");
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[1], json!({ "$limit": 1000 }));
    }

    #[test]
    fn aggregation_limit_is_clamped_not_duplicated() {
        let mut query = base(DocumentOp::Aggregate, "orders");
        query.pipeline = Some(vec![
            json!({ "$match": {} }),
            json!({ "$limit": 99_999 }),
        ]);
        let validated = gate().validate(query).expect("aggregate should pass");
        let pipeline = validated.pipeline.expect("pipeline should remain");
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline[1], json!({ "$limit": 1000 }));
    }

    #[test]
    fn insert_requires_a_document_body() {
        let query = base(DocumentOp::InsertOne, "users");
        let err = gate()
            .validate(query)
            .expect_err("insert without a body must be rejected");
        assert_eq!(err.rule(), "UNSUPPORTED_OPERATION");

        let mut query = base(DocumentOp::InsertOne, "users");
        query.document = Some(json!({ "name": "Ada" }));
        let validated: DocumentQuery = gate().validate(query).expect("insert should pass");
        assert!(matches!(validated.document, Some(Value::Object(_))));
    }
}

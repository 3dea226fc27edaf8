use bson::oid::ObjectId;
use bson::Bson;
use chrono::{Duration, Utc};
use serde_json::Value;

/// Date placeholders the planner and synthesizer are allowed to emit
/// instead of concrete timestamps.
const DATE_SENTINELS: &[(&str, i64)] = &[
    ("DATE_TODAY", 0),
    ("DATE_7_DAYS_AGO", 7),
    ("DATE_30_DAYS_AGO", 30),
];

fn sentinel_to_datetime(value: &str) -> Option<chrono::DateTime<Utc>> {
    DATE_SENTINELS
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, days)| Utc::now() - Duration::days(*days))
}

/// Replace date sentinels in a JSON tree with RFC 3339 timestamps.
/// Used for relational parameters and for echoed query descriptions.
pub fn coerce_sentinels(value: &Value) -> Value {
    match value {
        Value::String(s) => match sentinel_to_datetime(s) {
            Some(ts) => Value::String(ts.to_rfc3339()),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(coerce_sentinels).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), coerce_sentinels(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

fn is_hex24(value: &str) -> bool {
    value.len() == 24 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Convert a JSON tree to BSON. With `promote_ids`, strings matching the
/// 24-hex identifier pattern become native ObjectIds, and date sentinels
/// become BSON datetimes; this is used for filter positions only.
pub fn json_to_bson(value: &Value, promote_ids: bool) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => {
            if let Some(ts) = sentinel_to_datetime(s) {
                return Bson::DateTime(bson::DateTime::from_chrono(ts));
            }
            if promote_ids {
                if let Ok(oid) = ObjectId::parse_str(s) {
                    if is_hex24(s) {
                        return Bson::ObjectId(oid);
                    }
                }
            }
            Bson::String(s.clone())
        }
        Value::Array(items) => {
            Bson::Array(items.iter().map(|v| json_to_bson(v, promote_ids)).collect())
        }
        Value::Object(map) => {
            let mut doc = bson::Document::new();
            for (k, v) in map {
                doc.insert(k.clone(), json_to_bson(v, promote_ids));
            }
            Bson::Document(doc)
        }
    }
}

/// Convert a JSON object to a BSON document, promoting identifiers when
/// the value sits in a filter position.
pub fn json_to_document(value: &Value, promote_ids: bool) -> bson::Document {
    match json_to_bson(value, promote_ids) {
        Bson::Document(doc) => doc,
        other => {
            let mut doc = bson::Document::new();
            doc.insert("value", other);
            doc
        }
    }
}

/// Convert BSON back to JSON for previews and traces. ObjectIds and
/// datetimes are rendered as strings.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(dt.try_to_rfc3339_string().unwrap_or_default()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_json(v)))
                .collect(),
        ),
        other => Value::String(other.to_string()),
    }
}

pub fn document_to_json(doc: &bson::Document) -> Value {
    bson_to_json(&Bson::Document(doc.clone()))
}

#[cfg(test)]
mod tests {
    use super::{bson_to_json, coerce_sentinels, json_to_bson};
    use bson::Bson;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn date_sentinels_become_timestamps() {
        let filter = json!({ "createdAt": { "$gte": "DATE_7_DAYS_AGO" } });
        let coerced = coerce_sentinels(&filter);
        let raw = coerced["createdAt"]["$gte"]
            .as_str()
            .expect("sentinel should be replaced by a string timestamp");
        let ts = chrono::DateTime::parse_from_rfc3339(raw)
            .expect("replacement should be RFC 3339");
        let age = Utc::now().signed_duration_since(ts.with_timezone(&Utc));
        assert!(age.num_days() >= 6 && age.num_days() <= 8);
    }

    #[test]
    fn hex24_strings_promote_to_object_ids_in_filters() {
        let filter = json!({ "_id": "5f8d0d55b54764421b7156c3" });
        let bson = json_to_bson(&filter, true);
        let doc = match bson {
            Bson::Document(doc) => doc,
            other => panic!("expected document, got {other:?}"),
        };
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn hex24_strings_stay_strings_outside_filters() {
        let payload = json!({ "note": "5f8d0d55b54764421b7156c3" });
        let bson = json_to_bson(&payload, false);
        let doc = match bson {
            Bson::Document(doc) => doc,
            other => panic!("expected document, got {other:?}"),
        };
        assert!(matches!(doc.get("note"), Some(Bson::String(_))));
    }

    #[test]
    fn shorter_hex_strings_are_not_promoted() {
        let filter = json!({ "code": "deadbeef" });
        let bson = json_to_bson(&filter, true);
        let doc = match bson {
            Bson::Document(doc) => doc,
            other => panic!("expected document, got {other:?}"),
        };
        assert!(matches!(doc.get("code"), Some(Bson::String(_))));
    }

    #[test]
    fn bson_round_trips_to_presentable_json() {
        let doc = bson::doc! { "n": 3_i64, "ok": true, "name": "ada" };
        let json = bson_to_json(&Bson::Document(doc));
        assert_eq!(json, json!({ "n": 3, "ok": true, "name": "ada" }));
    }
}

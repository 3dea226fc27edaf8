use serde::{Deserialize, Serialize};
use serde_json::Value;

use querypilot_common::QueryKind;

/// Post-validation query actually sent to a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutedQuery {
    Document(DocumentQuery),
    Sql(SqlQuery),
}

impl ExecutedQuery {
    pub fn query_kind(&self) -> QueryKind {
        match self {
            Self::Document(q) => q.operation.query_kind(),
            Self::Sql(q) => q.kind,
        }
    }

    /// Collection or table the query targets, for trace and memory records.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Document(q) => Some(q.collection.as_str()),
            Self::Sql(q) => q.table.as_deref(),
        }
    }
}

/// Document-store operation set. Bulk write variants are deliberately
/// absent; [`DocumentOp::parse`] rejects them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentOp {
    Find,
    FindOne,
    Count,
    Aggregate,
    InsertOne,
    UpdateOne,
    DeleteOne,
}

impl DocumentOp {
    pub fn parse(value: &str) -> Result<Self, crate::SafetyViolation> {
        match value {
            "find" => Ok(Self::Find),
            "findOne" => Ok(Self::FindOne),
            "count" | "countDocuments" => Ok(Self::Count),
            "aggregate" => Ok(Self::Aggregate),
            "insertOne" => Ok(Self::InsertOne),
            "updateOne" => Ok(Self::UpdateOne),
            "deleteOne" => Ok(Self::DeleteOne),
            "updateMany" | "deleteMany" | "insertMany" => {
                Err(crate::SafetyViolation::BulkWriteForbidden(value.to_string()))
            }
            other => Err(crate::SafetyViolation::UnsupportedOperation(
                other.to_string(),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::InsertOne => "insertOne",
            Self::UpdateOne => "updateOne",
            Self::DeleteOne => "deleteOne",
        }
    }

    pub fn query_kind(self) -> QueryKind {
        match self {
            Self::Find => QueryKind::Read,
            Self::FindOne => QueryKind::ReadOne,
            Self::Count => QueryKind::Count,
            Self::Aggregate => QueryKind::Aggregate,
            Self::InsertOne => QueryKind::Insert,
            Self::UpdateOne => QueryKind::Update,
            Self::DeleteOne => QueryKind::Delete,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::InsertOne | Self::UpdateOne | Self::DeleteOne)
    }
}

/// Tagged document-store query record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuery {
    pub operation: DocumentOp,
    pub collection: String,
    #[serde(default = "empty_object")]
    pub filter: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Parameterized relational statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQuery {
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub kind: QueryKind,
}

#[cfg(test)]
mod tests {
    use super::DocumentOp;
    use crate::SafetyViolation;

    #[test]
    fn bulk_write_operations_are_rejected_by_name() {
        let err = DocumentOp::parse("updateMany").expect_err("bulk update must be rejected");
        assert!(matches!(err, SafetyViolation::BulkWriteForbidden(_)));
        let err = DocumentOp::parse("deleteMany").expect_err("bulk delete must be rejected");
        assert_eq!(err.rule(), "BULK_WRITE_FORBIDDEN");
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let err = DocumentOp::parse("mapReduce").expect_err("unknown op must be rejected");
        assert_eq!(err.rule(), "UNSUPPORTED_OPERATION");
    }

    #[test]
    fn known_operations_parse() {
        assert_eq!(
            DocumentOp::parse("find").expect("find should parse"),
            DocumentOp::Find
        );
        assert_eq!(
            DocumentOp::parse("countDocuments").expect("countDocuments should parse"),
            DocumentOp::Count
        );
    }
}

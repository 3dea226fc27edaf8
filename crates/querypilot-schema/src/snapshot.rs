use serde::{Deserialize, Serialize};

/// Normalized schema of one endpoint, in the shape persisted by the
/// registry and prompted to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaPayload {
    Document(Vec<DocumentCollection>),
    Relational(Vec<RelationalTable>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCollection {
    pub collection: String,
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub inferred_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub field: String,
    pub kind: RelationshipKind,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Declared by the source application's model layer.
    Reference,
    /// Inferred from `*Id`-style naming on identifier-typed fields.
    PotentialReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalTable {
    /// `schema.table` for engines with schemas, bare table name otherwise.
    pub qualified_table: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
    pub constraint_name: String,
}

/// Flat (name, fields) view used by the keyword matcher and the
/// heuristic synthesizer.
#[derive(Debug, Clone)]
pub struct SchemaEntity {
    pub name: String,
    pub fields: Vec<String>,
}

impl SchemaPayload {
    pub fn empty_json() -> String {
        "[]".to_string()
    }

    pub fn entity_count(&self) -> usize {
        match self {
            Self::Document(collections) => collections.len(),
            Self::Relational(tables) => tables.len(),
        }
    }

    pub fn entities(&self) -> Vec<SchemaEntity> {
        match self {
            Self::Document(collections) => collections
                .iter()
                .map(|c| SchemaEntity {
                    name: c.collection.clone(),
                    fields: c.fields.iter().map(|f| f.name.clone()).collect(),
                })
                .collect(),
            Self::Relational(tables) => tables
                .iter()
                .map(|t| SchemaEntity {
                    // Unqualified name is what user text refers to.
                    name: t
                        .qualified_table
                        .rsplit('.')
                        .next()
                        .unwrap_or(&t.qualified_table)
                        .to_string(),
                    fields: t.columns.iter().map(|c| c.name.clone()).collect(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| Self::empty_json())
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        // Try document shape first: both are arrays, so probe a marker key.
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let first = value.as_array()?.first();
        match first {
            Some(entry) if entry.get("collection").is_some() => {
                serde_json::from_str::<Vec<DocumentCollection>>(raw)
                    .ok()
                    .map(Self::Document)
            }
            Some(_) => serde_json::from_str::<Vec<RelationalTable>>(raw)
                .ok()
                .map(Self::Relational),
            None => Some(Self::Relational(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ColumnInfo, DocumentCollection, FieldInfo, RelationalTable, SchemaPayload,
    };

    fn document_payload() -> SchemaPayload {
        SchemaPayload::Document(vec![DocumentCollection {
            collection: "users".to_string(),
            fields: vec![FieldInfo {
                name: "email".to_string(),
                inferred_type: "String".to_string(),
                required: true,
                unique: false,
                reference: None,
            }],
            indexes: vec!["_id_".to_string()],
            relationships: vec![],
        }])
    }

    #[test]
    fn json_round_trip_recovers_the_same_shape() {
        let payload = document_payload();
        let json = payload.to_json();
        let back = SchemaPayload::from_json(&json).expect("payload should parse back");
        assert_eq!(back.entity_count(), 1);
        assert!(matches!(back, SchemaPayload::Document(_)));
    }

    #[test]
    fn relational_entities_drop_the_schema_qualifier() {
        let payload = SchemaPayload::Relational(vec![RelationalTable {
            qualified_table: "public.orders".to_string(),
            columns: vec![ColumnInfo {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            }],
            primary_key: vec!["id".to_string()],
            foreign_keys: vec![],
        }]);
        let entities = payload.entities();
        assert_eq!(entities[0].name, "orders");
        assert_eq!(entities[0].fields, vec!["id".to_string()]);
    }

    #[test]
    fn empty_json_parses_as_an_empty_schema() {
        let payload = SchemaPayload::from_json("[]").expect("empty array should parse");
        assert_eq!(payload.entity_count(), 0);
    }
}

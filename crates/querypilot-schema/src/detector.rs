use std::collections::BTreeMap;

use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use sqlx::{MySqlPool, PgPool, Row};
use tracing::warn;

use querypilot_common::{Error, Result};
use querypilot_connect::{DbHandle, Endpoint};

use crate::snapshot::{
    ColumnInfo, DocumentCollection, FieldInfo, ForeignKey, RelationalTable, Relationship,
    RelationshipKind, SchemaPayload,
};

/// Inferred-type precedence when a field shows more than one shape across
/// the sampled documents. Earlier wins.
const TYPE_PRECEDENCE: &[&str] = &[
    "Identifier",
    "String",
    "Number",
    "Boolean",
    "Date",
    "Object",
];

/// Introspect the endpoint's structure through a live handle.
pub async fn detect(
    handle: &DbHandle,
    endpoint: &Endpoint,
    sample_size: usize,
) -> Result<SchemaPayload> {
    match handle {
        DbHandle::Document(client) => detect_document(client, endpoint, sample_size).await,
        DbHandle::Postgres(pool) => detect_postgres(pool).await,
        DbHandle::MySql(pool) => detect_mysql(pool).await,
    }
}

async fn detect_document(
    client: &mongodb::Client,
    endpoint: &Endpoint,
    sample_size: usize,
) -> Result<SchemaPayload> {
    let db_name = endpoint
        .database_name()
        .or_else(|| client.default_database().map(|d| d.name().to_string()))
        .unwrap_or_else(|| "test".to_string());
    let db = client.database(&db_name);

    let names = db
        .list_collection_names()
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

    let mut collections = Vec::new();
    for name in names {
        if name.starts_with("system.") {
            continue;
        }
        let coll = db.collection::<Document>(&name);

        let mut samples: Vec<Document> = Vec::new();
        let cursor = coll.find(doc! {}).limit(sample_size as i64).await;
        match cursor {
            Ok(mut cursor) => {
                while let Some(document) = cursor
                    .try_next()
                    .await
                    .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?
                {
                    samples.push(document);
                }
            }
            Err(e) => {
                warn!(collection = name, "sampling failed, skipping fields: {e}");
            }
        }

        let indexes = coll.list_index_names().await.unwrap_or_default();

        let (fields, relationships) = infer_fields(&samples);
        collections.push(DocumentCollection {
            collection: name,
            fields,
            indexes,
            relationships,
        });
    }

    Ok(SchemaPayload::Document(collections))
}

struct FieldObservation {
    types: Vec<String>,
    seen: usize,
}

fn infer_fields(samples: &[Document]) -> (Vec<FieldInfo>, Vec<Relationship>) {
    let mut observed: BTreeMap<String, FieldObservation> = BTreeMap::new();

    for document in samples {
        for (key, value) in document {
            let bson_type = bson_type_name(value);
            let entry = observed.entry(key.clone()).or_insert(FieldObservation {
                types: Vec::new(),
                seen: 0,
            });
            entry.seen += 1;
            if !entry.types.contains(&bson_type) {
                entry.types.push(bson_type);
            }
        }
    }

    let total = samples.len();
    let mut fields = Vec::new();
    let mut relationships = Vec::new();

    for (name, observation) in observed {
        let inferred_type = resolve_type(&observation.types);
        let required = total > 0 && observation.seen == total;

        if inferred_type == "Identifier" && name.ends_with("Id") && name != "_id" {
            let target = reference_target(&name);
            relationships.push(Relationship {
                field: name.clone(),
                kind: RelationshipKind::PotentialReference,
                target: target.clone(),
            });
            fields.push(FieldInfo {
                name,
                inferred_type,
                required,
                unique: false,
                reference: Some(target),
            });
            continue;
        }

        fields.push(FieldInfo {
            unique: name == "_id",
            name,
            inferred_type,
            required,
            reference: None,
        });
    }

    (fields, relationships)
}

fn bson_type_name(value: &Bson) -> String {
    match value {
        Bson::ObjectId(_) => "Identifier".to_string(),
        Bson::String(_) => "String".to_string(),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
            "Number".to_string()
        }
        Bson::Boolean(_) => "Boolean".to_string(),
        Bson::DateTime(_) | Bson::Timestamp(_) => "Date".to_string(),
        Bson::Document(_) => "Object".to_string(),
        Bson::Array(items) => match items.first() {
            Some(first) => format!("Array<{}>", bson_type_name(first)),
            None => "Array<Mixed>".to_string(),
        },
        Bson::Null => "Null".to_string(),
        _ => "Mixed".to_string(),
    }
}

/// Union of observed types collapses by precedence; anything outside the
/// known ladder (arrays keep their element tag) falls back to Mixed when
/// mixed with other shapes.
fn resolve_type(types: &[String]) -> String {
    let concrete: Vec<&String> = types.iter().filter(|t| t.as_str() != "Null").collect();
    match concrete.len() {
        0 => "Mixed".to_string(),
        1 => concrete[0].clone(),
        _ => {
            for candidate in TYPE_PRECEDENCE {
                if concrete.iter().any(|t| t.as_str() == *candidate) {
                    return (*candidate).to_string();
                }
            }
            if let Some(array) = concrete.iter().find(|t| t.starts_with("Array<")) {
                return (*array).clone();
            }
            "Mixed".to_string()
        }
    }
}

/// `customerId` points at `customers` by convention.
fn reference_target(field: &str) -> String {
    let stem = field.trim_end_matches("Id");
    if stem.is_empty() {
        return field.to_string();
    }
    let mut target = stem.to_string();
    if !target.ends_with('s') {
        target.push('s');
    }
    target.to_lowercase()
}

async fn detect_postgres(pool: &PgPool) -> Result<SchemaPayload> {
    let table_rows = sqlx::query(
        "SELECT table_schema, table_name FROM information_schema.tables
         WHERE table_type = 'BASE TABLE'
           AND table_schema NOT IN ('pg_catalog', 'information_schema')
         ORDER BY table_schema, table_name",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

    let mut tables = Vec::new();
    for table_row in table_rows {
        let schema: String = table_row
            .try_get(0)
            .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
        let name: String = table_row
            .try_get(1)
            .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let column_rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
        )
        .bind(&schema)
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let mut columns = Vec::new();
        for row in column_rows {
            let column: String = row
                .try_get(0)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            let data_type: String = row
                .try_get(1)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            let nullable: String = row
                .try_get(2)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            columns.push(ColumnInfo {
                name: column,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
            });
        }

        let pk_rows = sqlx::query(
            "SELECT kcu.column_name
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tc.constraint_name
              AND kcu.table_schema = tc.table_schema
             WHERE tc.table_schema = $1 AND tc.table_name = $2
               AND tc.constraint_type = 'PRIMARY KEY'
             ORDER BY kcu.ordinal_position",
        )
        .bind(&schema)
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let primary_key = pk_rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect();

        let fk_rows = sqlx::query(
            "SELECT kcu.column_name, ccu.table_name, ccu.column_name, tc.constraint_name
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tc.constraint_name
              AND kcu.table_schema = tc.table_schema
             JOIN information_schema.constraint_column_usage ccu
               ON ccu.constraint_name = tc.constraint_name
              AND ccu.table_schema = tc.table_schema
             WHERE tc.table_schema = $1 AND tc.table_name = $2
               AND tc.constraint_type = 'FOREIGN KEY'",
        )
        .bind(&schema)
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let foreign_keys = fk_rows
            .iter()
            .filter_map(|row| {
                Some(ForeignKey {
                    column: row.try_get(0).ok()?,
                    ref_table: row.try_get(1).ok()?,
                    ref_column: row.try_get(2).ok()?,
                    constraint_name: row.try_get(3).ok()?,
                })
            })
            .collect();

        tables.push(RelationalTable {
            qualified_table: format!("{schema}.{name}"),
            columns,
            primary_key,
            foreign_keys,
        });
    }

    Ok(SchemaPayload::Relational(tables))
}

async fn detect_mysql(pool: &MySqlPool) -> Result<SchemaPayload> {
    let table_rows = sqlx::query(
        "SELECT table_name FROM information_schema.tables
         WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

    let mut tables = Vec::new();
    for table_row in table_rows {
        let name: String = table_row
            .try_get(0)
            .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let column_rows = sqlx::query(
            "SELECT column_name, data_type, is_nullable
             FROM information_schema.columns
             WHERE table_schema = DATABASE() AND table_name = ?
             ORDER BY ordinal_position",
        )
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let mut columns = Vec::new();
        for row in column_rows {
            let column: String = row
                .try_get(0)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            let data_type: String = row
                .try_get(1)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            let nullable: String = row
                .try_get(2)
                .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;
            columns.push(ColumnInfo {
                name: column,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
            });
        }

        let pk_rows = sqlx::query(
            "SELECT column_name FROM information_schema.key_column_usage
             WHERE table_schema = DATABASE() AND table_name = ?
               AND constraint_name = 'PRIMARY'
             ORDER BY ordinal_position",
        )
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let primary_key = pk_rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect();

        let fk_rows = sqlx::query(
            "SELECT column_name, referenced_table_name, referenced_column_name, constraint_name
             FROM information_schema.key_column_usage
             WHERE table_schema = DATABASE() AND table_name = ?
               AND referenced_table_name IS NOT NULL",
        )
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::SchemaBuildFailed(e.to_string()))?;

        let foreign_keys = fk_rows
            .iter()
            .filter_map(|row| {
                Some(ForeignKey {
                    column: row.try_get(0).ok()?,
                    ref_table: row.try_get(1).ok()?,
                    ref_column: row.try_get(2).ok()?,
                    constraint_name: row.try_get(3).ok()?,
                })
            })
            .collect();

        tables.push(RelationalTable {
            qualified_table: name,
            columns,
            primary_key,
            foreign_keys,
        });
    }

    Ok(SchemaPayload::Relational(tables))
}

#[cfg(test)]
mod tests {
    use super::{infer_fields, reference_target, resolve_type};
    use crate::snapshot::RelationshipKind;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn fields_present_in_every_sample_are_required() {
        let samples = vec![
            doc! { "_id": ObjectId::new(), "name": "Ada", "age": 36 },
            doc! { "_id": ObjectId::new(), "name": "Grace" },
        ];
        let (fields, _) = infer_fields(&samples);

        let name = fields
            .iter()
            .find(|f| f.name == "name")
            .expect("name field should be observed");
        assert!(name.required);
        assert_eq!(name.inferred_type, "String");

        let age = fields
            .iter()
            .find(|f| f.name == "age")
            .expect("age field should be observed");
        assert!(!age.required);
        assert_eq!(age.inferred_type, "Number");
    }

    #[test]
    fn id_suffixed_identifier_fields_become_potential_references() {
        let samples = vec![doc! { "_id": ObjectId::new(), "customerId": ObjectId::new() }];
        let (fields, relationships) = infer_fields(&samples);

        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].field, "customerId");
        assert_eq!(relationships[0].kind, RelationshipKind::PotentialReference);
        assert_eq!(relationships[0].target, "customers");

        let field = fields
            .iter()
            .find(|f| f.name == "customerId")
            .expect("customerId should be observed");
        assert_eq!(field.reference.as_deref(), Some("customers"));
    }

    #[test]
    fn mixed_observations_collapse_by_precedence() {
        assert_eq!(
            resolve_type(&["Number".to_string(), "String".to_string()]),
            "String"
        );
        assert_eq!(
            resolve_type(&["Boolean".to_string(), "Identifier".to_string()]),
            "Identifier"
        );
        assert_eq!(resolve_type(&["Null".to_string()]), "Mixed");
        assert_eq!(
            resolve_type(&["Array<String>".to_string()]),
            "Array<String>"
        );
    }

    #[test]
    fn reference_targets_are_pluralized_collection_names() {
        assert_eq!(reference_target("customerId"), "customers");
        assert_eq!(reference_target("orderId"), "orders");
        assert_eq!(reference_target("statusId"), "status");
    }

    #[test]
    fn the_primary_id_field_is_unique_not_a_reference() {
        let samples = vec![doc! { "_id": ObjectId::new() }];
        let (fields, relationships) = infer_fields(&samples);
        assert!(relationships.is_empty());
        let id = fields.first().expect("_id should be observed");
        assert!(id.unique);
        assert_eq!(id.inferred_type, "Identifier");
    }
}

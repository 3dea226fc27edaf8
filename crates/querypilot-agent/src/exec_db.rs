use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::Document;
use serde_json::{json, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row};
use tokio::time::timeout;

use querypilot_common::{Error, QueryKind, Result};
use querypilot_connect::DbHandle;
use querypilot_safety::coerce::{document_to_json, json_to_document};
use querypilot_safety::{DocumentOp, DocumentQuery, ExecutedQuery, SqlQuery};

/// Rows and total count captured from one executed query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub count: i64,
}

/// Execute a gated query against the live handle under a wall-clock
/// deadline. Only gated queries reach this function.
pub async fn execute(
    handle: &DbHandle,
    database: &str,
    query: &ExecutedQuery,
    deadline: Duration,
) -> Result<QueryResult> {
    match (handle, query) {
        (DbHandle::Document(client), ExecutedQuery::Document(q)) => {
            let work = run_document(client, database, q);
            timeout(deadline, work)
                .await
                .map_err(|_| Error::Timeout("statement deadline exceeded".to_string()))?
        }
        (DbHandle::Postgres(pool), ExecutedQuery::Sql(q)) => {
            let work = run_postgres(pool, q);
            timeout(deadline, work)
                .await
                .map_err(|_| Error::Timeout("statement deadline exceeded".to_string()))?
        }
        (DbHandle::MySql(pool), ExecutedQuery::Sql(q)) => {
            let work = run_mysql(pool, q);
            timeout(deadline, work)
                .await
                .map_err(|_| Error::Timeout("statement deadline exceeded".to_string()))?
        }
        _ => Err(Error::Db(
            "query family does not match the connection".to_string(),
        )),
    }
}

async fn run_document(
    client: &mongodb::Client,
    database: &str,
    query: &DocumentQuery,
) -> Result<QueryResult> {
    let db = client.database(database);
    let coll = db.collection::<Document>(&query.collection);
    let filter = json_to_document(&query.filter, true);

    match query.operation {
        DocumentOp::Find => {
            let mut action = coll.find(filter);
            if let Some(projection) = &query.projection {
                action = action.projection(json_to_document(projection, false));
            }
            if let Some(sort) = &query.sort {
                action = action.sort(json_to_document(sort, false));
            }
            if let Some(limit) = query.limit {
                action = action.limit(limit);
            }
            let mut cursor = action.await.map_err(|e| Error::Db(e.to_string()))?;
            let mut rows = Vec::new();
            while let Some(document) = cursor
                .try_next()
                .await
                .map_err(|e| Error::Db(e.to_string()))?
            {
                rows.push(document_to_json(&document));
            }
            let count = rows.len() as i64;
            Ok(QueryResult { rows, count })
        }
        DocumentOp::FindOne => {
            let mut action = coll.find_one(filter);
            if let Some(projection) = &query.projection {
                action = action.projection(json_to_document(projection, false));
            }
            let found = action.await.map_err(|e| Error::Db(e.to_string()))?;
            let rows: Vec<Value> = found.iter().map(document_to_json).collect();
            let count = rows.len() as i64;
            Ok(QueryResult { rows, count })
        }
        DocumentOp::Count => {
            let count = coll
                .count_documents(filter)
                .await
                .map_err(|e| Error::Db(e.to_string()))? as i64;
            Ok(QueryResult {
                rows: vec![json!({ "count": count })],
                count,
            })
        }
        DocumentOp::Aggregate => {
            let stages: Vec<Document> = query
                .pipeline
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|stage| json_to_document(stage, true))
                .collect();
            let mut cursor = coll
                .aggregate(stages)
                .await
                .map_err(|e| Error::Db(e.to_string()))?;
            let mut rows = Vec::new();
            while let Some(document) = cursor
                .try_next()
                .await
                .map_err(|e| Error::Db(e.to_string()))?
            {
                rows.push(document_to_json(&document));
            }
            let count = rows.len() as i64;
            Ok(QueryResult { rows, count })
        }
        DocumentOp::InsertOne => {
            let body = query
                .document
                .as_ref()
                .ok_or_else(|| Error::Db("insertOne without a document".to_string()))?;
            let inserted = coll
                .insert_one(json_to_document(body, false))
                .await
                .map_err(|e| Error::Db(e.to_string()))?;
            Ok(QueryResult {
                rows: vec![json!({
                    "insertedId": inserted.inserted_id.to_string(),
                })],
                count: 1,
            })
        }
        DocumentOp::UpdateOne => {
            let update = query
                .update
                .as_ref()
                .ok_or_else(|| Error::Db("updateOne without an update".to_string()))?;
            let outcome = coll
                .update_one(filter, json_to_document(update, false))
                .await
                .map_err(|e| Error::Db(e.to_string()))?;
            Ok(QueryResult {
                rows: vec![json!({
                    "matched": outcome.matched_count,
                    "modified": outcome.modified_count,
                })],
                count: outcome.modified_count as i64,
            })
        }
        DocumentOp::DeleteOne => {
            let outcome = coll
                .delete_one(filter)
                .await
                .map_err(|e| Error::Db(e.to_string()))?;
            Ok(QueryResult {
                rows: vec![json!({ "deleted": outcome.deleted_count })],
                count: outcome.deleted_count as i64,
            })
        }
    }
}

async fn run_postgres(pool: &sqlx::PgPool, query: &SqlQuery) -> Result<QueryResult> {
    if query.kind == QueryKind::Sql {
        let mut prepared = sqlx::query(&query.sql);
        for parameter in &query.parameters {
            prepared = bind_pg(prepared, parameter);
        }
        let rows = prepared
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Db(e.to_string()))?;
        let rows: Vec<Value> = rows.iter().map(pg_row_to_json).collect();
        let count = rows.len() as i64;
        Ok(QueryResult { rows, count })
    } else {
        let mut prepared = sqlx::query(&query.sql);
        for parameter in &query.parameters {
            prepared = bind_pg(prepared, parameter);
        }
        let outcome = prepared
            .execute(pool)
            .await
            .map_err(|e| Error::Db(e.to_string()))?;
        let affected = outcome.rows_affected() as i64;
        Ok(QueryResult {
            rows: vec![json!({ "rowsAffected": affected })],
            count: affected,
        })
    }
}

async fn run_mysql(pool: &sqlx::MySqlPool, query: &SqlQuery) -> Result<QueryResult> {
    if query.kind == QueryKind::Sql {
        let mut prepared = sqlx::query(&query.sql);
        for parameter in &query.parameters {
            prepared = bind_mysql(prepared, parameter);
        }
        let rows = prepared
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Db(e.to_string()))?;
        let rows: Vec<Value> = rows.iter().map(mysql_row_to_json).collect();
        let count = rows.len() as i64;
        Ok(QueryResult { rows, count })
    } else {
        let mut prepared = sqlx::query(&query.sql);
        for parameter in &query.parameters {
            prepared = bind_mysql(prepared, parameter);
        }
        let outcome = prepared
            .execute(pool)
            .await
            .map_err(|e| Error::Db(e.to_string()))?;
        let affected = outcome.rows_affected() as i64;
        Ok(QueryResult {
            rows: vec![json!({ "rowsAffected": affected })],
            count: affected,
        })
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_pg<'q>(query: PgQuery<'q>, parameter: &'q Value) -> PgQuery<'q> {
    match parameter {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.clone()),
    }
}

type MySqlQuery<'q> = sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>;

fn bind_mysql<'q>(query: MySqlQuery<'q>, parameter: &'q Value) -> MySqlQuery<'q> {
    match parameter {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.clone()),
    }
}

fn pg_row_to_json(row: &PgRow) -> Value {
    let mut map = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), pg_cell(row, index));
    }
    Value::Object(map)
}

/// Decode one cell by probing common types; unmapped types degrade to
/// null rather than failing the whole row.
fn pg_cell(row: &PgRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<i16>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f32>, _>(index) {
        return value
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return value
            .map(|v| Value::from(v.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return value
            .map(|v| Value::from(v.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return value
            .map(|v| Value::from(v.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Value>, _>(index) {
        return value.unwrap_or(Value::Null);
    }
    Value::Null
}

fn mysql_row_to_json(row: &MySqlRow) -> Value {
    let mut map = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), mysql_cell(row, index));
    }
    Value::Object(map)
}

fn mysql_cell(row: &MySqlRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return value
            .map(|v| Value::from(v.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return value
            .map(|v| Value::from(v.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return value
            .map(|v| Value::from(v.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Value>, _>(index) {
        return value.unwrap_or(Value::Null);
    }
    Value::Null
}

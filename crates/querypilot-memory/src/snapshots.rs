use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use querypilot_common::{Error, Result};

use crate::store::{parse_timestamp, MetaStore};

/// Persisted schema registry entry. The payload is the normalized schema
/// JSON; it never contains credentials because the key derivation already
/// stripped them from the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub db_key: String,
    pub kind: String,
    pub payload: String,
    pub table_count: i64,
    pub last_built: DateTime<Utc>,
}

impl MetaStore {
    pub fn get_snapshot(&self, db_key: &str) -> Result<Option<StoredSnapshot>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT db_key, kind, payload, table_count, last_built
                 FROM schema_snapshots WHERE db_key = ?1",
            )
            .map_err(|e| Error::Store(format!("failed to prepare snapshot query: {e}")))?;

        let mut rows = stmt
            .query_map(params![db_key], |row| {
                let last_built: String = row.get(4)?;
                Ok(StoredSnapshot {
                    db_key: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                    table_count: row.get(3)?,
                    last_built: parse_timestamp(&last_built),
                })
            })
            .map_err(|e| Error::Store(format!("failed to load snapshot: {e}")))?;

        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| {
                Error::Store(format!("failed to read snapshot row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn put_snapshot(
        &self,
        db_key: &str,
        kind: &str,
        payload: &str,
        table_count: i64,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO schema_snapshots (db_key, kind, payload, table_count, last_built)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(db_key) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                table_count = excluded.table_count,
                last_built = excluded.last_built",
            params![db_key, kind, payload, table_count, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(format!("failed to store snapshot: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MetaStore;

    #[test]
    fn snapshot_upsert_round_trip_advances_last_built() {
        let store = MetaStore::in_memory().expect("store should open");
        assert!(store
            .get_snapshot("missing")
            .expect("get should succeed")
            .is_none());

        store
            .put_snapshot("abc:document", "document", "[]", 0)
            .expect("put should succeed");
        let first = store
            .get_snapshot("abc:document")
            .expect("get should succeed")
            .expect("snapshot should exist");
        assert_eq!(first.table_count, 0);

        store
            .put_snapshot("abc:document", "document", "[{\"collection\":\"users\"}]", 1)
            .expect("put should succeed");
        let second = store
            .get_snapshot("abc:document")
            .expect("get should succeed")
            .expect("snapshot should exist");
        assert_eq!(second.table_count, 1);
        assert!(second.last_built >= first.last_built);
    }
}

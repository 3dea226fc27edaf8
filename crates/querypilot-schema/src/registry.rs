use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use querypilot_common::Result;
use querypilot_connect::{DbHandle, Endpoint};
use querypilot_memory::MetaStore;

use crate::detector;
use crate::snapshot::SchemaPayload;

/// TTL-cached schema snapshots keyed by the endpoint's credential-free
/// db key. Rebuilds for the same key are single-flight.
pub struct SchemaRegistry {
    store: Arc<MetaStore>,
    ttl: Duration,
    sample_size: usize,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<MetaStore>, ttl_ms: u64, sample_size: usize) -> Self {
        Self {
            store,
            ttl: Duration::milliseconds(ttl_ms as i64),
            sample_size,
            inflight: DashMap::new(),
        }
    }

    /// Return the schema JSON for the endpoint, rebuilding when stale or
    /// forced. Introspection failure degrades to an empty schema.
    pub async fn get_or_build(
        &self,
        endpoint: &Endpoint,
        handle: &DbHandle,
        force_rebuild: bool,
    ) -> Result<String> {
        let db_key = endpoint.db_key();

        if !force_rebuild {
            if let Some(cached) = self.fresh_payload(&db_key)? {
                return Ok(cached);
            }
        }

        // Coalesce concurrent rebuilds: the second caller waits, then
        // observes the row the first caller stored.
        let gate = self
            .inflight
            .entry(db_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if !force_rebuild {
            if let Some(cached) = self.fresh_payload(&db_key)? {
                return Ok(cached);
            }
        }

        let payload = match detector::detect(handle, endpoint, self.sample_size).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(db_key, "schema introspection failed, degrading to empty: {e}");
                drop(_guard);
                self.inflight.remove(&db_key);
                return Ok(SchemaPayload::empty_json());
            }
        };

        let json = payload.to_json();
        let entity_count = payload.entity_count() as i64;
        if let Err(e) =
            self.store
                .put_snapshot(&db_key, endpoint.kind().as_str(), &json, entity_count)
        {
            // A failed cache write never masks a usable schema.
            warn!(db_key, "failed to persist schema snapshot: {e}");
        } else {
            info!(db_key, entities = entity_count, "schema snapshot rebuilt");
        }

        drop(_guard);
        self.inflight.remove(&db_key);
        Ok(json)
    }

    fn fresh_payload(&self, db_key: &str) -> Result<Option<String>> {
        let Some(snapshot) = self.store.get_snapshot(db_key)? else {
            return Ok(None);
        };
        if Utc::now() - snapshot.last_built < self.ttl {
            Ok(Some(snapshot.payload))
        } else {
            Ok(None)
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mongodb::bson::doc;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, MySqlPool, PgPool};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use querypilot_common::{Error, Result};

use crate::endpoint::{Endpoint, EndpointKind};

/// A live driver handle for one of the three database families.
///
/// Clones share the underlying client/pool, so equal URLs observe the
/// same handle identity.
#[derive(Clone, Debug)]
pub enum DbHandle {
    Document(mongodb::Client),
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl DbHandle {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Document(_) => EndpointKind::Document,
            Self::Postgres(_) => EndpointKind::Postgres,
            Self::MySql(_) => EndpointKind::MySql,
        }
    }
}

/// Per-URL cached connections for all three database families.
///
/// First insertion runs a bounded liveness probe; concurrent construction
/// for the same URL is coalesced so only one probe runs.
pub struct ConnectionPool {
    document: DashMap<String, mongodb::Client>,
    postgres: DashMap<String, PgPool>,
    mysql: DashMap<String, MySqlPool>,
    building: DashMap<String, Arc<Mutex<()>>>,
    pool_max_size: u32,
    statement_timeout: Duration,
    preflight_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        pool_max_size: u32,
        statement_timeout: Duration,
        preflight_timeout: Duration,
    ) -> Self {
        Self {
            document: DashMap::new(),
            postgres: DashMap::new(),
            mysql: DashMap::new(),
            building: DashMap::new(),
            pool_max_size,
            statement_timeout,
            preflight_timeout,
        }
    }

    /// Return a live handle for the endpoint, building and probing it on
    /// first use.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<DbHandle> {
        let url = endpoint.url();

        if let Some(handle) = self.cached(endpoint.kind(), url) {
            return Ok(handle);
        }

        // Coalesce concurrent construction for the same URL: the second
        // caller waits here and then observes the first caller's entry.
        let gate = self
            .building
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(handle) = self.cached(endpoint.kind(), url) {
            return Ok(handle);
        }

        let result = self.build(endpoint).await;
        drop(_guard);
        self.building.remove(url);

        match &result {
            Ok(_) => info!(
                kind = endpoint.kind().as_str(),
                url = endpoint.sanitized_url(),
                "connection established"
            ),
            Err(e) => warn!(
                kind = endpoint.kind().as_str(),
                url = endpoint.sanitized_url(),
                "connection failed: {e}"
            ),
        }
        result
    }

    fn cached(&self, kind: EndpointKind, url: &str) -> Option<DbHandle> {
        match kind {
            EndpointKind::Document => self
                .document
                .get(url)
                .map(|c| DbHandle::Document(c.clone())),
            EndpointKind::Postgres => self.postgres.get(url).map(|p| DbHandle::Postgres(p.clone())),
            EndpointKind::MySql => self.mysql.get(url).map(|p| DbHandle::MySql(p.clone())),
        }
    }

    async fn build(&self, endpoint: &Endpoint) -> Result<DbHandle> {
        let url = endpoint.url();
        match endpoint.kind() {
            EndpointKind::Document => {
                let client = self.build_document(url).await?;
                self.document.insert(url.to_string(), client.clone());
                Ok(DbHandle::Document(client))
            }
            EndpointKind::Postgres => {
                let pool = self.build_postgres(url).await?;
                self.postgres.insert(url.to_string(), pool.clone());
                Ok(DbHandle::Postgres(pool))
            }
            EndpointKind::MySql => {
                let pool = self.build_mysql(url).await?;
                self.mysql.insert(url.to_string(), pool.clone());
                Ok(DbHandle::MySql(pool))
            }
        }
    }

    async fn build_document(&self, url: &str) -> Result<mongodb::Client> {
        let client = mongodb::Client::with_uri_str(url)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        // The driver connects lazily; an explicit ping is the preflight.
        let admin_db = client.database("admin");
        let ping = admin_db.run_command(doc! { "ping": 1 });
        timeout(self.preflight_timeout, ping)
            .await
            .map_err(|_| Error::ConnectionFailed("preflight ping timed out".to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        Ok(client)
    }

    async fn build_postgres(&self, url: &str) -> Result<PgPool> {
        let statement_ms = self.statement_timeout.as_millis() as u64;
        let options = PgPoolOptions::new()
            .max_connections(self.pool_max_size)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let stmt = format!("SET statement_timeout = {statement_ms}");
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            });

        let pool = timeout(self.preflight_timeout, options.connect(url))
            .await
            .map_err(|_| Error::ConnectionFailed("connect timed out".to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let probe = sqlx::query("SELECT 1").execute(&pool);
        timeout(self.preflight_timeout, probe)
            .await
            .map_err(|_| Error::ConnectionFailed("preflight probe timed out".to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        Ok(pool)
    }

    async fn build_mysql(&self, url: &str) -> Result<MySqlPool> {
        let statement_ms = self.statement_timeout.as_millis() as u64;
        let options = MySqlPoolOptions::new()
            .max_connections(self.pool_max_size)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let stmt = format!("SET SESSION max_execution_time = {statement_ms}");
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            });

        let pool = timeout(self.preflight_timeout, options.connect(url))
            .await
            .map_err(|_| Error::ConnectionFailed("connect timed out".to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let probe = sqlx::query("SELECT 1").execute(&pool);
        timeout(self.preflight_timeout, probe)
            .await
            .map_err(|_| Error::ConnectionFailed("preflight probe timed out".to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        Ok(pool)
    }

    /// Number of cached handles across all families (diagnostics only).
    pub fn cached_count(&self) -> usize {
        self.document.len() + self.postgres.len() + self.mysql.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionPool;
    use crate::endpoint::Endpoint;
    use std::time::Duration;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(2, Duration::from_secs(15), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn failed_preflight_leaves_no_cache_entry() {
        let pool = pool();
        // Nothing listens on this port; the probe must fail fast and the
        // cache must stay empty so a later attempt can retry.
        let endpoint = Endpoint::new("mongodb://127.0.0.1:1/none", None)
            .expect("endpoint should parse");

        let result = pool.acquire(&endpoint).await;
        assert!(result.is_err());
        assert_eq!(
            result.err().map(|e| e.is_framing()),
            Some(true),
            "preflight failure is a framing error"
        );
        assert_eq!(pool.cached_count(), 0);
    }

    #[tokio::test]
    async fn postgres_connect_failure_is_connection_failed() {
        let pool = pool();
        let endpoint = Endpoint::new("postgres://127.0.0.1:1/none", None)
            .expect("endpoint should parse");

        let err = pool
            .acquire(&endpoint)
            .await
            .expect_err("nothing listens on port 1");
        assert_eq!(err.kind(), "ConnectionFailed");
    }
}

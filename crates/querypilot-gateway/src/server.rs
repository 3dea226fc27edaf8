use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use querypilot_agent::{AgentPipeline, HttpOracle, Oracle};
use querypilot_common::{Error, Result};
use querypilot_config::AppConfig;
use querypilot_connect::ConnectionPool;
use querypilot_memory::MetaStore;
use querypilot_schema::SchemaRegistry;

use crate::router::build_router;
use crate::state::AppState;

/// The gateway server: wires every subsystem once, binds, and serves the
/// HTTP API plus the WebSocket playground channel.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);

        let data_dir = self
            .config
            .data_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".querypilot").join("data")))
            .unwrap_or_else(|| ".querypilot/data".into());
        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            warn!("failed to create data directory: {e}");
        }
        let meta = Arc::new(MetaStore::open(&data_dir.join("meta.db"))?);

        let pool = Arc::new(ConnectionPool::new(
            self.config.pool.max_size,
            Duration::from_millis(self.config.limits.query_timeout_ms),
            Duration::from_millis(self.config.limits.preflight_timeout_ms),
        ));
        let registry = Arc::new(SchemaRegistry::new(
            Arc::clone(&meta),
            self.config.schema.ttl_ms,
            self.config.schema.sample_size,
        ));

        let oracle: Option<Arc<dyn Oracle>> = if self.config.oracle.enabled {
            info!(
                base_url = self.config.oracle.base_url,
                model = self.config.oracle.model,
                "language-model oracle enabled"
            );
            Some(Arc::new(HttpOracle::new(&self.config.oracle)))
        } else {
            info!("no oracle configured; planner and summaries use deterministic fallbacks");
            None
        };

        let pipeline = AgentPipeline::new(
            &self.config,
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&meta),
            oracle,
        );

        let state = Arc::new(AppState::new(self.config, pipeline, meta));
        state.spawn_session_sweeper();

        let app = build_router(Arc::clone(&state));
        let listener = TcpListener::bind(&addr).await?;
        info!("querypilot gateway listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Other(format!("server error: {e}")))?;

        info!("gateway shut down gracefully");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

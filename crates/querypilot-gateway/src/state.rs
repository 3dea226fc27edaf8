use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use querypilot_agent::AgentPipeline;
use querypilot_config::AppConfig;
use querypilot_connect::Endpoint;
use querypilot_memory::MetaStore;

/// How often the housekeeping sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Fan-out buffer per session; slow subscribers drop old events.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Shared application state wired once at startup and handed to every
/// handler.
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: AgentPipeline,
    pub meta: Arc<MetaStore>,
    /// In-process per-session state: the live endpoint (with credentials,
    /// never persisted) and the fan-out channel for session events.
    pub live: DashMap<String, LiveSession>,
}

pub struct LiveSession {
    pub user_id: String,
    pub endpoint: Option<Endpoint>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// One realtime event published to every socket joined to a session.
/// `origin` lets the publishing socket skip its own copy (it already
/// sent the event directly, preserving per-socket ordering).
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub origin: String,
    pub payload: String,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: AgentPipeline, meta: Arc<MetaStore>) -> Self {
        Self {
            config,
            pipeline,
            meta,
            live: DashMap::new(),
        }
    }

    /// The live entry for a session, created on first touch.
    pub fn live_session(&self, session_id: &str, user_id: &str) -> broadcast::Sender<SessionEvent> {
        self.live
            .entry(session_id.to_string())
            .or_insert_with(|| LiveSession {
                user_id: user_id.to_string(),
                endpoint: None,
                events: broadcast::channel(SESSION_CHANNEL_CAPACITY).0,
            })
            .events
            .clone()
    }

    pub fn remember_endpoint(&self, session_id: &str, endpoint: Endpoint) {
        if let Some(mut session) = self.live.get_mut(session_id) {
            session.endpoint = Some(endpoint);
        }
    }

    pub fn last_endpoint(&self, session_id: &str) -> Option<Endpoint> {
        self.live
            .get(session_id)
            .and_then(|session| session.endpoint.clone())
    }

    pub fn forget_session(&self, session_id: &str) {
        self.live.remove(session_id);
    }

    pub fn publish(&self, session_id: &str, origin: &str, payload: String) {
        if let Some(session) = self.live.get(session_id) {
            let _ = session.events.send(SessionEvent {
                origin: origin.to_string(),
                payload,
            });
        }
    }

    /// Periodic housekeeping: idle sessions become inactive, long-dead
    /// sessions are purged from storage.
    pub fn spawn_session_sweeper(self: &Arc<Self>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let idle = chrono::Duration::minutes(state.config.sessions.idle_timeout_mins as i64);
            let expiry = chrono::Duration::days(state.config.sessions.expiry_days as i64);
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match state.meta.mark_idle_sessions(idle) {
                    Ok(0) => {}
                    Ok(flipped) => info!("marked {flipped} session(s) idle"),
                    Err(e) => warn!("idle sweep failed: {e}"),
                }
                match state.meta.purge_expired_sessions(expiry) {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!("purged {removed} expired session(s)");
                    }
                    Err(e) => warn!("expiry purge failed: {e}"),
                }
            }
        });
    }
}

pub type SharedState = Arc<AppState>;

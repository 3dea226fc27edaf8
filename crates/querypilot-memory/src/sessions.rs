use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use querypilot_common::{
    ChatMessage, Error, MessageMetadata, MessageRole, Result, SessionId,
};

use crate::store::{parse_timestamp, MetaStore};

/// Per-session conversational context carried between turns.
///
/// The persisted endpoint form is credential-free; the raw URL needed to
/// reconnect lives only in the in-process session registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_endpoint: Option<StoredEndpoint>,
    #[serde(default)]
    pub recent_queries: Vec<String>,
}

pub const RECENT_QUERIES_LIMIT: usize = 5;

impl SessionContext {
    pub fn push_recent_query(&mut self, text: impl Into<String>) {
        self.recent_queries.push(text.into());
        while self.recent_queries.len() > RECENT_QUERIES_LIMIT {
            self.recent_queries.remove(0);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEndpoint {
    /// Sanitized (credential-free) URL, display only.
    pub url: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub last_activity: chrono::DateTime<Utc>,
    pub message_count: i64,
    pub active: bool,
    pub context: SessionContext,
}

impl MetaStore {
    pub fn create_session(&self, user_id: &str, title: Option<&str>) -> Result<SessionRow> {
        self.create_session_with_id(&Uuid::new_v4().to_string(), user_id, title)
    }

    /// Create a session under a caller-chosen id (clients may propose the
    /// session id when joining over the realtime channel).
    pub fn create_session_with_id(
        &self,
        id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRow> {
        let id = id.to_string();
        let now = Utc::now();
        let context = SessionContext::default();
        let context_json = serde_json::to_string(&context)?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO chat_sessions (id, user_id, title, created_at, last_activity, message_count, active, context)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6)",
            params![id, user_id, title, now.to_rfc3339(), now.to_rfc3339(), context_json],
        )
        .map_err(|e| Error::Store(format!("failed to create session: {e}")))?;

        Ok(SessionRow {
            id,
            user_id: user_id.to_string(),
            title: title.map(|t| t.to_string()),
            created_at: now,
            last_activity: now,
            message_count: 0,
            active: false,
            context,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, title, created_at, last_activity, message_count, active, context
                 FROM chat_sessions WHERE id = ?1",
            )
            .map_err(|e| Error::Store(format!("failed to prepare session query: {e}")))?;

        let mut rows = stmt
            .query_map(params![session_id], row_to_session)
            .map_err(|e| Error::Store(format!("failed to load session: {e}")))?;

        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| Error::Store(format!("failed to read session row: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    /// Mark a session joined/active and bump its activity timestamp.
    pub fn touch_session(&self, session_id: &str, activate: bool) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE chat_sessions
             SET last_activity = ?2, active = CASE WHEN ?3 THEN 1 ELSE active END
             WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339(), activate],
        )
        .map_err(|e| Error::Store(format!("failed to touch session: {e}")))?;
        Ok(())
    }

    pub fn update_session_context(&self, session_id: &str, context: &SessionContext) -> Result<()> {
        let context_json = serde_json::to_string(context)?;
        let conn = self.connection()?;
        conn.execute(
            "UPDATE chat_sessions SET context = ?2, last_activity = ?3 WHERE id = ?1",
            params![session_id, context_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(format!("failed to update session context: {e}")))?;
        Ok(())
    }

    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, title, created_at, last_activity, message_count, active, context
                 FROM chat_sessions WHERE user_id = ?1 ORDER BY last_activity DESC",
            )
            .map_err(|e| Error::Store(format!("failed to prepare session list: {e}")))?;

        let rows = stmt
            .query_map(params![user_id], row_to_session)
            .map_err(|e| Error::Store(format!("failed to list sessions: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Store(format!("failed to collect session rows: {e}")))
    }

    pub fn count_sessions(&self, user_id: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT count(*) FROM chat_sessions WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Store(format!("failed to count sessions: {e}")))
    }

    /// Delete a session and its messages. Returns false when absent.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| Error::Store(format!("failed to delete session messages: {e}")))?;
        let deleted = conn
            .execute("DELETE FROM chat_sessions WHERE id = ?1", params![session_id])
            .map_err(|e| Error::Store(format!("failed to delete session: {e}")))?;
        Ok(deleted > 0)
    }

    /// Housekeeping sweep: sessions idle longer than `idle` become
    /// inactive. Returns the number of sessions flipped.
    pub fn mark_idle_sessions(&self, idle: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - idle).to_rfc3339();
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE chat_sessions SET active = 0
                 WHERE active = 1 AND last_activity < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Store(format!("failed to mark idle sessions: {e}")))?;
        Ok(changed)
    }

    /// Storage-level expiry: remove sessions (and their messages) inactive
    /// longer than `expiry`.
    pub fn purge_expired_sessions(&self, expiry: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - expiry).to_rfc3339();
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM chat_messages WHERE session_id IN
                (SELECT id FROM chat_sessions WHERE last_activity < ?1)",
            params![cutoff],
        )
        .map_err(|e| Error::Store(format!("failed to purge expired messages: {e}")))?;
        let removed = conn
            .execute(
                "DELETE FROM chat_sessions WHERE last_activity < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Store(format!("failed to purge expired sessions: {e}")))?;
        Ok(removed)
    }

    pub fn append_message(&self, message: &ChatMessage) -> Result<()> {
        let metadata_json = serde_json::to_string(&message.metadata)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO chat_messages (id, session_id, sender, role, text, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.session_id.as_str(),
                message.sender,
                message.role.as_str(),
                message.text,
                message.timestamp.to_rfc3339(),
                metadata_json
            ],
        )
        .map_err(|e| Error::Store(format!("failed to append message: {e}")))?;

        conn.execute(
            "UPDATE chat_sessions SET message_count = message_count + 1, last_activity = ?2
             WHERE id = ?1",
            params![message.session_id.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(format!("failed to bump message count: {e}")))?;

        Ok(())
    }

    /// Recent messages in chronological order.
    pub fn load_recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, sender, role, text, timestamp, metadata
                 FROM chat_messages WHERE session_id = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Store(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, limit as i64], row_to_message)
            .map_err(|e| Error::Store(format!("failed to load messages: {e}")))?;

        let mut messages = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Store(format!("failed to collect message rows: {e}")))?;

        // Query is DESC for efficient tail fetch; return chronologically.
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let created_at: String = row.get(3)?;
    let last_activity: String = row.get(4)?;
    let context_raw: String = row.get(7)?;
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_timestamp(&created_at),
        last_activity: parse_timestamp(&last_activity),
        message_count: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        context: serde_json::from_str(&context_raw).unwrap_or_default(),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role_raw: String = row.get(3)?;
    let timestamp_raw: String = row.get(5)?;
    let metadata_raw: String = row.get(6)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: SessionId::from_str(row.get::<_, String>(1)?),
        sender: row.get(2)?,
        role: MessageRole::from_db(&role_raw).unwrap_or(MessageRole::System),
        text: row.get(4)?,
        timestamp: parse_timestamp(&timestamp_raw),
        metadata: serde_json::from_str::<MessageMetadata>(&metadata_raw).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::{SessionContext, StoredEndpoint, RECENT_QUERIES_LIMIT};
    use crate::store::MetaStore;
    use chrono::Duration;
    use querypilot_common::{ChatMessage, MessageMetadata, SessionId};

    #[test]
    fn create_join_and_list_round_trip() {
        let store = MetaStore::in_memory().expect("store should open");
        let session = store
            .create_session("u-1", Some("orders digging"))
            .expect("session create should succeed");
        assert!(!session.active);

        store
            .touch_session(&session.id, true)
            .expect("touch should succeed");
        let loaded = store
            .get_session(&session.id)
            .expect("get should succeed")
            .expect("session should exist");
        assert!(loaded.active);

        let listed = store.list_sessions("u-1").expect("list should succeed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("orders digging"));
    }

    #[test]
    fn context_round_trips_with_endpoint_and_recent_queries() {
        let store = MetaStore::in_memory().expect("store should open");
        let session = store
            .create_session("u-1", None)
            .expect("session create should succeed");

        let mut context = SessionContext::default();
        context.last_endpoint = Some(StoredEndpoint {
            url: "mongodb://host:27017/shop".to_string(),
            kind: "document".to_string(),
        });
        for i in 0..7 {
            context.push_recent_query(format!("query {i}"));
        }
        store
            .update_session_context(&session.id, &context)
            .expect("context update should succeed");

        let loaded = store
            .get_session(&session.id)
            .expect("get should succeed")
            .expect("session should exist");
        assert_eq!(loaded.context.recent_queries.len(), RECENT_QUERIES_LIMIT);
        assert_eq!(loaded.context.recent_queries[0], "query 2");
        assert_eq!(
            loaded
                .context
                .last_endpoint
                .expect("endpoint should round-trip")
                .kind,
            "document"
        );
    }

    #[test]
    fn messages_append_and_load_in_order() {
        let store = MetaStore::in_memory().expect("store should open");
        let session = store
            .create_session("u-1", None)
            .expect("session create should succeed");
        let sid = SessionId::from_str(session.id.clone());

        let user = ChatMessage::user(sid.clone(), "u-1", "how many orders?");
        let agent = ChatMessage::agent(sid, "Retrieved 1 record(s)", MessageMetadata::default());
        store.append_message(&user).expect("user append should succeed");
        store
            .append_message(&agent)
            .expect("agent append should succeed");

        let messages = store
            .load_recent_messages(&session.id, 10)
            .expect("load should succeed");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "how many orders?");
        assert!(messages[1].timestamp >= messages[0].timestamp);

        let loaded = store
            .get_session(&session.id)
            .expect("get should succeed")
            .expect("session should exist");
        assert_eq!(loaded.message_count, 2);
    }

    #[test]
    fn idle_sweep_only_touches_stale_active_sessions() {
        let store = MetaStore::in_memory().expect("store should open");
        let fresh = store
            .create_session("u-1", None)
            .expect("session create should succeed");
        store
            .touch_session(&fresh.id, true)
            .expect("touch should succeed");

        // A session touched just now is not idle.
        let flipped = store
            .mark_idle_sessions(Duration::minutes(60))
            .expect("sweep should succeed");
        assert_eq!(flipped, 0);

        // With a zero timeout everything active becomes idle.
        let flipped = store
            .mark_idle_sessions(Duration::zero())
            .expect("sweep should succeed");
        assert_eq!(flipped, 1);
    }

    #[test]
    fn purge_removes_sessions_and_their_messages() {
        let store = MetaStore::in_memory().expect("store should open");
        let session = store
            .create_session("u-1", None)
            .expect("session create should succeed");
        let sid = SessionId::from_str(session.id.clone());
        store
            .append_message(&ChatMessage::user(sid, "u-1", "hello"))
            .expect("append should succeed");

        let removed = store
            .purge_expired_sessions(Duration::zero())
            .expect("purge should succeed");
        assert_eq!(removed, 1);
        assert!(store
            .get_session(&session.id)
            .expect("get should succeed")
            .is_none());
        let messages = store
            .load_recent_messages(&session.id, 10)
            .expect("load should succeed");
        assert!(messages.is_empty());
    }

    #[test]
    fn delete_session_checks_existence() {
        let store = MetaStore::in_memory().expect("store should open");
        assert!(!store
            .delete_session("missing")
            .expect("delete should not error"));
        let session = store
            .create_session("u-1", None)
            .expect("session create should succeed");
        assert!(store
            .delete_session(&session.id)
            .expect("delete should succeed"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{QueryKind, SessionId};

/// One conversational turn half, persisted append-only per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    /// User id for user messages, the literal `"agent"` for agent replies.
    pub sender: String,
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_kind: Option<QueryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_retrieved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ChatMessage {
    pub fn user(session_id: SessionId, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            sender: user_id.into(),
            role: MessageRole::User,
            text: text.into(),
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn agent(
        session_id: SessionId,
        text: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            sender: "agent".to_string(),
            role: MessageRole::Agent,
            text: text.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, MessageMetadata, MessageRole};
    use crate::types::SessionId;

    #[test]
    fn agent_reply_is_never_earlier_than_the_user_turn() {
        let session = SessionId::from_str("s-1");
        let user = ChatMessage::user(session.clone(), "u-1", "show me the orders");
        let agent = ChatMessage::agent(session, "Retrieved 3 record(s)", MessageMetadata::default());
        assert!(agent.timestamp >= user.timestamp);
        assert_eq!(agent.sender, "agent");
        assert_eq!(agent.role, MessageRole::Agent);
    }

    #[test]
    fn metadata_defaults_serialize_to_empty_object() {
        let metadata = MessageMetadata::default();
        let json = serde_json::to_value(&metadata).expect("metadata should serialize");
        assert_eq!(json, serde_json::json!({}));
    }
}

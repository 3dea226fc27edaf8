use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(String);

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserId(String);

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueryId(String);

macro_rules! impl_id_type {
    ($t:ty) => {
        impl $t {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

impl_id_type!(SessionId);
impl_id_type!(UserId);
impl_id_type!(QueryId);

/// Classification of an executed (or attempted) operation, recorded per
/// turn for personalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Read,
    ReadOne,
    Count,
    Aggregate,
    Sql,
    Insert,
    Update,
    Delete,
    Conversation,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::ReadOne => "read_one",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::Sql => "sql",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Conversation => "conversation",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "read_one" => Some(Self::ReadOne),
            "count" => Some(Self::Count),
            "aggregate" => Some(Self::Aggregate),
            "sql" => Some(Self::Sql),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "conversation" => Some(Self::Conversation),
            _ => None,
        }
    }

    /// Writes require stricter gate treatment than reads.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryKind, SessionId};

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SessionId::from_str("session-1");
        assert_eq!(id.as_str(), "session-1");
        assert_eq!(id.to_string(), "session-1");
    }

    #[test]
    fn query_kind_round_trips_through_db_form() {
        for kind in [
            QueryKind::Read,
            QueryKind::ReadOne,
            QueryKind::Count,
            QueryKind::Aggregate,
            QueryKind::Sql,
            QueryKind::Insert,
            QueryKind::Update,
            QueryKind::Delete,
            QueryKind::Conversation,
        ] {
            assert_eq!(QueryKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(QueryKind::from_db("bulk_delete"), None);
    }

    #[test]
    fn write_kinds_are_flagged() {
        assert!(QueryKind::Delete.is_write());
        assert!(!QueryKind::Read.is_write());
        assert!(!QueryKind::Conversation.is_write());
    }
}

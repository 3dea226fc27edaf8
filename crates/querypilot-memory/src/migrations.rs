/// Versioned schema for the meta store.
///
/// One migration per version; applied in order at open time.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const META_SCHEMA_V1_SQL: &str = "
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 0,
    context TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_activity
    ON chat_sessions(user_id, last_activity);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    role TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp
    ON chat_messages(session_id, timestamp);

CREATE TABLE IF NOT EXISTS memory_records (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    db_key TEXT NOT NULL,
    original_text TEXT NOT NULL,
    query_description TEXT NOT NULL,
    query_kind TEXT NOT NULL,
    targets TEXT NOT NULL DEFAULT '[]',
    execution_millis INTEGER NOT NULL DEFAULT 0,
    result_count INTEGER NOT NULL DEFAULT 0,
    succeeded INTEGER NOT NULL DEFAULT 0,
    feedback TEXT,
    context_tags TEXT NOT NULL DEFAULT '[]',
    pattern_label TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_user_created_at
    ON memory_records(user_id, created_at);

CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    frequent_collections TEXT NOT NULL DEFAULT '[]',
    pattern_counters TEXT NOT NULL DEFAULT '[]',
    skill_level TEXT NOT NULL DEFAULT 'beginner',
    preferred_detail TEXT NOT NULL DEFAULT 'brief',
    common_mistakes TEXT NOT NULL DEFAULT '[]',
    successful_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_snapshots (
    db_key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    table_count INTEGER NOT NULL DEFAULT 0,
    last_built TEXT NOT NULL
);
";

pub const META_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "meta_schema_v1",
    sql: META_SCHEMA_V1_SQL,
};

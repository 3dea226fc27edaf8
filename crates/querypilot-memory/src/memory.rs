use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use querypilot_common::{Error, QueryKind, Result};

use crate::records::{
    DetailLevel, Feedback, MemoryInsights, MemoryRecord, NewMemoryRecord, SkillLevel, UserProfile,
};
use crate::store::{json_list, parse_timestamp, MetaStore};

impl MetaStore {
    /// Insert one turn record. The record is immutable afterwards except
    /// for feedback.
    pub fn insert_record(&self, record: &NewMemoryRecord) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let targets_json = serde_json::to_string(&record.targets)?;
        let tags_json = serde_json::to_string(&record.context_tags)?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO memory_records (
                id, user_id, db_key, original_text, query_description, query_kind,
                targets, execution_millis, result_count, succeeded, feedback,
                context_tags, pattern_label, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12, ?13)",
            params![
                id,
                record.user_id,
                record.db_key,
                record.original_text,
                record.query_description,
                record.query_kind.as_str(),
                targets_json,
                record.execution_millis,
                record.result_count,
                record.succeeded,
                tags_json,
                record.pattern_label,
                created_at,
            ],
        )
        .map_err(|e| Error::Store(format!("failed to insert memory record: {e}")))?;

        Ok(id)
    }

    /// Attach feedback to an owned record. Returns false when the record
    /// does not exist or belongs to another user.
    pub fn set_feedback(&self, record_id: &str, user_id: &str, feedback: Feedback) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE memory_records SET feedback = ?3 WHERE id = ?1 AND user_id = ?2",
                params![record_id, user_id, feedback.as_str()],
            )
            .map_err(|e| Error::Store(format!("failed to set feedback: {e}")))?;
        Ok(changed > 0)
    }

    pub fn recent_records(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, db_key, original_text, query_description, query_kind,
                        targets, execution_millis, result_count, succeeded, feedback,
                        context_tags, pattern_label, created_at
                 FROM memory_records WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Store(format!("failed to prepare record query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id, limit as i64], row_to_record)
            .map_err(|e| Error::Store(format!("failed to load records: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Store(format!("failed to collect record rows: {e}")))
    }

    /// How many prior records share this pattern against the same
    /// database. Drives the `similar_queries` insight.
    pub fn similar_query_count(
        &self,
        user_id: &str,
        db_key: &str,
        pattern_label: &str,
    ) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT count(*) FROM memory_records
             WHERE user_id = ?1 AND db_key = ?2 AND pattern_label = ?3",
            params![user_id, db_key, pattern_label],
            |row| row.get(0),
        )
        .map_err(|e| Error::Store(format!("failed to count similar queries: {e}")))
    }

    pub fn get_profile(&self, user_id: &str) -> Result<UserProfile> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, frequent_collections, pattern_counters, skill_level,
                        preferred_detail, common_mistakes, successful_count, updated_at
                 FROM user_profiles WHERE user_id = ?1",
            )
            .map_err(|e| Error::Store(format!("failed to prepare profile query: {e}")))?;

        let mut rows = stmt
            .query_map(params![user_id], row_to_profile)
            .map_err(|e| Error::Store(format!("failed to load profile: {e}")))?;

        match rows.next() {
            Some(row) => row.map_err(|e| Error::Store(format!("failed to read profile row: {e}"))),
            None => Ok(UserProfile::new(user_id)),
        }
    }

    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let collections_json = serde_json::to_string(&profile.frequent_collections)?;
        let counters_json = serde_json::to_string(&profile.pattern_counters)?;
        let mistakes_json = serde_json::to_string(&profile.common_mistakes)?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO user_profiles (
                user_id, frequent_collections, pattern_counters, skill_level,
                preferred_detail, common_mistakes, successful_count, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id) DO UPDATE SET
                frequent_collections = excluded.frequent_collections,
                pattern_counters = excluded.pattern_counters,
                skill_level = excluded.skill_level,
                preferred_detail = excluded.preferred_detail,
                common_mistakes = excluded.common_mistakes,
                successful_count = excluded.successful_count,
                updated_at = excluded.updated_at",
            params![
                profile.user_id,
                collections_json,
                counters_json,
                profile.skill_level.as_str(),
                profile.preferred_detail.as_str(),
                mistakes_json,
                profile.successful_count,
                profile.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Store(format!("failed to save profile: {e}")))?;
        Ok(())
    }

    /// Record a turn and fold it into the user's profile. Returns the new
    /// record id and the (possibly promoted) profile.
    pub fn record_turn(&self, record: &NewMemoryRecord) -> Result<(String, UserProfile)> {
        let id = self.insert_record(record)?;
        let mut profile = self.get_profile(&record.user_id)?;
        let promoted = profile.apply_turn(record);
        self.save_profile(&profile)?;
        if promoted {
            tracing::info!(
                user_id = record.user_id,
                skill = profile.skill_level.as_str(),
                "user skill level changed"
            );
        }
        Ok((id, profile))
    }

    /// Insights for a turn about to run: prior similar-query count plus
    /// the profile's current state.
    pub fn insights_for(
        &self,
        user_id: &str,
        db_key: &str,
        pattern_label: &str,
    ) -> Result<MemoryInsights> {
        let similar = self.similar_query_count(user_id, db_key, pattern_label)?;
        let profile = self.get_profile(user_id)?;
        Ok(MemoryInsights {
            similar_queries: similar,
            skill_level: profile.skill_level,
            pattern_label: pattern_label.to_string(),
            frequent_collections: profile.frequent_collections,
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let kind_raw: String = row.get(5)?;
    let targets_raw: String = row.get(6)?;
    let feedback_raw: Option<String> = row.get(10)?;
    let tags_raw: String = row.get(11)?;
    let created_raw: String = row.get(13)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        db_key: row.get(2)?,
        original_text: row.get(3)?,
        query_description: row.get(4)?,
        query_kind: QueryKind::from_db(&kind_raw).unwrap_or(QueryKind::Read),
        targets: json_list(&targets_raw),
        execution_millis: row.get(7)?,
        result_count: row.get(8)?,
        succeeded: row.get::<_, i64>(9)? != 0,
        feedback: feedback_raw.as_deref().and_then(Feedback::from_db),
        context_tags: json_list(&tags_raw),
        pattern_label: row.get(12)?,
        created_at: parse_timestamp(&created_raw),
    })
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let collections_raw: String = row.get(1)?;
    let counters_raw: String = row.get(2)?;
    let skill_raw: String = row.get(3)?;
    let detail_raw: String = row.get(4)?;
    let mistakes_raw: String = row.get(5)?;
    let updated_raw: String = row.get(7)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        frequent_collections: json_list(&collections_raw),
        pattern_counters: serde_json::from_str(&counters_raw).unwrap_or_default(),
        skill_level: SkillLevel::from_db(&skill_raw).unwrap_or(SkillLevel::Beginner),
        preferred_detail: DetailLevel::from_db(&detail_raw).unwrap_or(DetailLevel::Brief),
        common_mistakes: json_list(&mistakes_raw),
        successful_count: row.get(6)?,
        updated_at: parse_timestamp(&updated_raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Feedback, NewMemoryRecord, SkillLevel};
    use crate::store::MetaStore;

    fn record(user_id: &str, pattern: &str, succeeded: bool) -> NewMemoryRecord {
        NewMemoryRecord {
            user_id: user_id.to_string(),
            db_key: "abc:document".to_string(),
            original_text: "how many users".to_string(),
            query_description: format!("{pattern} heuristic"),
            query_kind: QueryKind::Count,
            targets: vec!["users".to_string()],
            execution_millis: 5,
            result_count: 1,
            succeeded,
            context_tags: vec![],
            pattern_label: pattern.to_string(),
        }
    }

    #[test]
    fn record_turn_updates_profile_and_counts_similars() {
        let store = MetaStore::in_memory().expect("store should open");

        let (first_id, profile) = store
            .record_turn(&record("u-1", "count:users", true))
            .expect("record should persist");
        assert!(!first_id.is_empty());
        assert_eq!(profile.successful_count, 1);
        assert_eq!(profile.skill_level, SkillLevel::Beginner);

        store
            .record_turn(&record("u-1", "count:users", true))
            .expect("record should persist");

        let similar = store
            .similar_query_count("u-1", "abc:document", "count:users")
            .expect("count should succeed");
        assert_eq!(similar, 2);
    }

    #[test]
    fn failed_turns_are_recorded_and_feed_common_mistakes() {
        let store = MetaStore::in_memory().expect("store should open");
        store
            .record_turn(&record("u-1", "delete:orders", false))
            .expect("record should persist");

        let profile = store.get_profile("u-1").expect("profile should load");
        assert_eq!(profile.successful_count, 0);
        assert_eq!(profile.common_mistakes, vec!["delete:orders".to_string()]);

        let records = store
            .recent_records("u-1", 10)
            .expect("records should load");
        assert_eq!(records.len(), 1);
        assert!(!records[0].succeeded);
        assert_eq!(records[0].query_kind, QueryKind::Count);
    }

    #[test]
    fn feedback_requires_matching_owner() {
        let store = MetaStore::in_memory().expect("store should open");
        let (id, _) = store
            .record_turn(&record("u-1", "count:users", true))
            .expect("record should persist");

        assert!(!store
            .set_feedback(&id, "someone-else", Feedback::Positive)
            .expect("update should not error"));
        assert!(store
            .set_feedback(&id, "u-1", Feedback::Positive)
            .expect("update should succeed"));

        let records = store.recent_records("u-1", 1).expect("records should load");
        assert_eq!(records[0].feedback, Some(Feedback::Positive));
    }

    #[test]
    fn insights_reflect_prior_turns() {
        let store = MetaStore::in_memory().expect("store should open");
        store
            .record_turn(&record("u-1", "count:users", true))
            .expect("record should persist");

        let insights = store
            .insights_for("u-1", "abc:document", "count:users")
            .expect("insights should load");
        assert_eq!(insights.similar_queries, 1);
        assert_eq!(insights.skill_level, SkillLevel::Beginner);
        assert_eq!(insights.frequent_collections, vec!["users".to_string()]);
    }
}

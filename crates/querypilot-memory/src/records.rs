use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use querypilot_common::QueryKind;

/// One executed (or attempted) turn, persisted for personalization.
/// Immutable after write except for `feedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub db_key: String,
    pub original_text: String,
    pub query_description: String,
    pub query_kind: QueryKind,
    pub targets: Vec<String>,
    pub execution_millis: i64,
    pub result_count: i64,
    pub succeeded: bool,
    pub feedback: Option<Feedback>,
    pub context_tags: Vec<String>,
    pub pattern_label: String,
    pub created_at: DateTime<Utc>,
}

/// Insert shape before the store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemoryRecord {
    pub user_id: String,
    pub db_key: String,
    pub original_text: String,
    pub query_description: String,
    pub query_kind: QueryKind,
    pub targets: Vec<String>,
    pub execution_millis: i64,
    pub result_count: i64,
    pub succeeded: bool,
    pub context_tags: Vec<String>,
    pub pattern_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "positive" | "+" => Some(Self::Positive),
            "negative" | "-" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl SkillLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }

    /// Promotion thresholds: the 51st successful record promotes to
    /// intermediate, the 151st to advanced.
    pub fn from_success_count(count: i64) -> Self {
        if count > 150 {
            Self::Advanced
        } else if count > 50 {
            Self::Intermediate
        } else {
            Self::Beginner
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Brief,
    Verbose,
}

impl DetailLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Verbose => "verbose",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "brief" => Some(Self::Brief),
            "verbose" => Some(Self::Verbose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCounter {
    pub label: String,
    pub count: i64,
    pub last_used: DateTime<Utc>,
}

/// Aggregated per-user behavioral state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub frequent_collections: Vec<String>,
    pub pattern_counters: Vec<PatternCounter>,
    pub skill_level: SkillLevel,
    pub preferred_detail: DetailLevel,
    pub common_mistakes: Vec<String>,
    pub successful_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            frequent_collections: Vec::new(),
            pattern_counters: Vec::new(),
            skill_level: SkillLevel::Beginner,
            preferred_detail: DetailLevel::Brief,
            common_mistakes: Vec::new(),
            successful_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one turn into the profile. Returns true when the skill level
    /// changed.
    pub fn apply_turn(&mut self, record: &NewMemoryRecord) -> bool {
        let now = Utc::now();

        for target in &record.targets {
            if target != "n/a" && !self.frequent_collections.contains(target) {
                self.frequent_collections.push(target.clone());
            }
        }

        match self
            .pattern_counters
            .iter_mut()
            .find(|c| c.label == record.pattern_label)
        {
            Some(counter) => {
                counter.count += 1;
                counter.last_used = now;
            }
            None => self.pattern_counters.push(PatternCounter {
                label: record.pattern_label.clone(),
                count: 1,
                last_used: now,
            }),
        }

        if record.succeeded {
            self.successful_count += 1;
        } else if !self.common_mistakes.contains(&record.pattern_label) {
            self.common_mistakes.push(record.pattern_label.clone());
        }

        let next = SkillLevel::from_success_count(self.successful_count);
        let changed = next != self.skill_level;
        self.skill_level = next;
        self.updated_at = now;
        changed
    }
}

/// Compact personalization context handed to the planner and echoed in
/// verbose responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInsights {
    pub similar_queries: i64,
    pub skill_level: SkillLevel,
    pub pattern_label: String,
    pub frequent_collections: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{NewMemoryRecord, SkillLevel, UserProfile};
    use querypilot_common::QueryKind;

    fn turn(succeeded: bool) -> NewMemoryRecord {
        NewMemoryRecord {
            user_id: "u-1".to_string(),
            db_key: "k".to_string(),
            original_text: "count users".to_string(),
            query_description: "count on users".to_string(),
            query_kind: QueryKind::Count,
            targets: vec!["users".to_string()],
            execution_millis: 12,
            result_count: 1,
            succeeded,
            context_tags: vec![],
            pattern_label: "count:users".to_string(),
        }
    }

    #[test]
    fn skill_transitions_exactly_at_51_and_151() {
        assert_eq!(SkillLevel::from_success_count(50), SkillLevel::Beginner);
        assert_eq!(SkillLevel::from_success_count(51), SkillLevel::Intermediate);
        assert_eq!(SkillLevel::from_success_count(150), SkillLevel::Intermediate);
        assert_eq!(SkillLevel::from_success_count(151), SkillLevel::Advanced);
    }

    #[test]
    fn fifty_first_success_promotes_the_profile() {
        let mut profile = UserProfile::new("u-1");
        for _ in 0..50 {
            profile.apply_turn(&turn(true));
        }
        assert_eq!(profile.skill_level, SkillLevel::Beginner);

        let changed = profile.apply_turn(&turn(true));
        assert!(changed, "51st success should promote");
        assert_eq!(profile.skill_level, SkillLevel::Intermediate);
    }

    #[test]
    fn failures_accumulate_deduplicated_mistakes() {
        let mut profile = UserProfile::new("u-1");
        profile.apply_turn(&turn(false));
        profile.apply_turn(&turn(false));
        assert_eq!(profile.common_mistakes, vec!["count:users".to_string()]);
        assert_eq!(profile.successful_count, 0);
    }

    #[test]
    fn pattern_counters_increment_per_label() {
        let mut profile = UserProfile::new("u-1");
        profile.apply_turn(&turn(true));
        profile.apply_turn(&turn(true));
        assert_eq!(profile.pattern_counters.len(), 1);
        assert_eq!(profile.pattern_counters[0].count, 2);
        assert_eq!(profile.frequent_collections, vec!["users".to_string()]);
    }
}

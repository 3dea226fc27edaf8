pub mod memory;
pub mod migrations;
pub mod records;
pub mod sessions;
pub mod snapshots;
pub mod store;

pub use records::{
    DetailLevel, Feedback, MemoryInsights, MemoryRecord, NewMemoryRecord, PatternCounter,
    SkillLevel, UserProfile,
};
pub use sessions::{SessionContext, SessionRow, StoredEndpoint, RECENT_QUERIES_LIMIT};
pub use snapshots::StoredSnapshot;
pub use store::MetaStore;

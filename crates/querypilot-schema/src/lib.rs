pub mod detector;
pub mod keywords;
pub mod profiler;
pub mod registry;
pub mod snapshot;

pub use registry::SchemaRegistry;
pub use snapshot::{
    ColumnInfo, DocumentCollection, FieldInfo, ForeignKey, RelationalTable, Relationship,
    RelationshipKind, SchemaEntity, SchemaPayload,
};

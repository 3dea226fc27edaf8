pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{ChatMessage, MessageMetadata, MessageRole};
pub use types::{QueryId, QueryKind, SessionId, UserId};

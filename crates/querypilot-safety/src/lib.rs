pub mod coerce;
pub mod document;
pub mod query;
pub mod sql;

pub use document::DocumentGate;
pub use query::{DocumentOp, DocumentQuery, ExecutedQuery, SqlQuery};
pub use sql::{SqlDialect, SqlGate};

use thiserror::Error;

/// Field names never returned to callers by default. Matching is
/// case-insensitive substring on the lowercased field name.
pub const SENSITIVE_FIELDS: &[&str] = &["password", "secret", "token", "apikey", "salt"];

/// One rule of the safety gate, with a stable machine-readable code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    #[error("MULTIPLE_STATEMENTS")]
    MultipleStatements,

    #[error("FORBIDDEN_VERB: {0}")]
    ForbiddenVerb(String),

    #[error("COMMENT_SYNTAX")]
    CommentSyntax,

    #[error("UPDATE_WITHOUT_WHERE")]
    UpdateWithoutWhere,

    #[error("DELETE_WITHOUT_WHERE")]
    DeleteWithoutWhere,

    #[error("PARAMETER_MISMATCH: {placeholders} placeholder(s), {parameters} parameter(s)")]
    ParameterMismatch {
        placeholders: usize,
        parameters: usize,
    },

    #[error("EMPTY_STATEMENT")]
    EmptyStatement,

    #[error("DANGEROUS_OPERATOR: {0}")]
    DangerousOperator(String),

    #[error("WRITE_STAGE_FORBIDDEN: {0}")]
    WriteStageForbidden(String),

    #[error("BULK_WRITE_FORBIDDEN: {0}")]
    BulkWriteForbidden(String),

    #[error("EMPTY_WRITE_FILTER")]
    EmptyWriteFilter,

    #[error("UNSUPPORTED_OPERATION: {0}")]
    UnsupportedOperation(String),
}

impl SafetyViolation {
    pub fn rule(&self) -> &'static str {
        match self {
            Self::MultipleStatements => "MULTIPLE_STATEMENTS",
            Self::ForbiddenVerb(_) => "FORBIDDEN_VERB",
            Self::CommentSyntax => "COMMENT_SYNTAX",
            Self::UpdateWithoutWhere => "UPDATE_WITHOUT_WHERE",
            Self::DeleteWithoutWhere => "DELETE_WITHOUT_WHERE",
            Self::ParameterMismatch { .. } => "PARAMETER_MISMATCH",
            Self::EmptyStatement => "EMPTY_STATEMENT",
            Self::DangerousOperator(_) => "DANGEROUS_OPERATOR",
            Self::WriteStageForbidden(_) => "WRITE_STAGE_FORBIDDEN",
            Self::BulkWriteForbidden(_) => "BULK_WRITE_FORBIDDEN",
            Self::EmptyWriteFilter => "EMPTY_WRITE_FILTER",
            Self::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
        }
    }
}

impl From<SafetyViolation> for querypilot_common::Error {
    fn from(violation: SafetyViolation) -> Self {
        querypilot_common::Error::SafetyRejected(violation.to_string())
    }
}

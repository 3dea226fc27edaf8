use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("BadInput: {0}")]
    BadInput(String),

    #[error("UnsupportedEndpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("ConnectionFailed: {0}")]
    ConnectionFailed(String),

    #[error("SchemaBuildFailed: {0}")]
    SchemaBuildFailed(String),

    #[error("PlanParseFailed: {0}")]
    PlanParseFailed(String),

    #[error("SafetyRejected: {0}")]
    SafetyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("DbError: {0}")]
    Db(String),

    #[error("SessionNotFound: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("ConfigError: {0}")]
    Config(String),

    #[error("StoreError: {0}")]
    Store(String),

    #[error("OracleError: {0}")]
    Oracle(String),

    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),

    #[error("SerializationError: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-readable error kind used in wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "BadInput",
            Self::UnsupportedEndpoint(_) => "UnsupportedEndpoint",
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::SchemaBuildFailed(_) => "SchemaBuildFailed",
            Self::PlanParseFailed(_) => "PlanParseFailed",
            Self::SafetyRejected(_) => "SafetyRejected",
            Self::Timeout(_) => "Timeout",
            Self::Db(_) => "DbError",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Config(_) => "ConfigError",
            Self::Store(_) => "StoreError",
            Self::Oracle(_) => "OracleError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
            Self::Other(_) => "Error",
        }
    }

    /// True for errors that abort the whole request rather than a single
    /// plan step.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::BadInput(_) | Self::UnsupportedEndpoint(_) | Self::ConnectionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_leads_with_kind() {
        let err = Error::SafetyRejected("DELETE_WITHOUT_WHERE".to_string());
        assert_eq!(err.to_string(), "SafetyRejected: DELETE_WITHOUT_WHERE");
    }

    #[test]
    fn framing_errors_abort_the_request() {
        assert!(Error::BadInput("query too short".into()).is_framing());
        assert!(Error::ConnectionFailed("refused".into()).is_framing());
        assert!(!Error::SafetyRejected("MULTIPLE_STATEMENTS".into()).is_framing());
        assert!(!Error::Timeout("statement deadline".into()).is_framing());
    }
}

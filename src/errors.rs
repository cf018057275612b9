/// Domain-specific error types for the journal.
/// Pure computation (key derivation, aggregation, draws) never fails. Errors only
/// come from boundary validation, lookups, and the persistence collaborator:
/// - Rejected commands leave every store untouched
/// - Persistence failures are logged and never roll back in-memory state
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0} session already active")]
    SessionActive(&'static str),

    #[error("no active {0} session")]
    NoActiveSession(&'static str),

    #[error("database error: {0}")]
    Database(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl JournalError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        JournalError::NotFound { kind, id: id.into() }
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for JournalError {
    fn from(e: rusqlite::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

pub type JournalResult<T> = Result<T, JournalError>;

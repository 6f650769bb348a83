use thiserror::Error;
use uuid::Uuid;

/// Result type alias for front-end operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Unified error type for the database front end.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] granite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("malformed log record: {0}")]
    LogParse(String),

    #[error("unknown transaction {0}")]
    TransactionUnknown(Uuid),

    #[error("transaction {0} is already running")]
    TransactionActive(Uuid),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("deadlock detected")]
    Deadlock,

    #[error("join cancelled")]
    Cancelled,

    #[error("usage: {0}")]
    Usage(&'static str),
}

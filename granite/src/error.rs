use crate::PageNum;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The database file is structurally invalid (bad length, bad meta).
    #[error("corrupt database file: {0}")]
    CorruptFile(String),

    /// Every frame in the buffer pool is pinned.
    #[error("no free pages available in the buffer pool")]
    NoFreePage,

    #[error("invalid page number {0}")]
    InvalidPageNumber(PageNum),

    #[error("cannot insert duplicate key {0}")]
    DuplicateKey(i64),

    #[error("key {0} not found")]
    NotFound(i64),

    /// A cursor was advanced past the last entry of a table.
    #[error("cannot advance the cursor further")]
    EndOfScan,
}

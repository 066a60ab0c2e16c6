//! Error types for the SQLite driver

use thiserror::Error;

/// SQLite driver error type
#[derive(Error, Debug)]
pub enum SqliteError {
    /// Database could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Value has no SQLite representation
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<SqliteError> for quarry_core::Error {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Connection(msg) => Self::backend("connect", msg),
            SqliteError::Conversion(msg) => Self::Serialization(msg),
            SqliteError::Rusqlite(e) => Self::backend("", e),
        }
    }
}

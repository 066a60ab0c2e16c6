//! Error types for statement compilation and execution

use crate::filter::Operator;
use thiserror::Error;

/// Error type for every quarry operation
///
/// Compilation errors (usage and integrity variants) are produced before any
/// SQL reaches the connection. `Backend` wraps whatever the driver reported.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The query matched zero rows
    #[error("entity not found")]
    NotFound,

    /// Pagination cursor is forged, stale or belongs to another query shape
    #[error("invalid cursor")]
    InvalidCursor,

    /// Key string does not follow the segment grammar
    #[error("malformed key {input:?}: {reason}")]
    MalformedKey { input: String, reason: String },

    /// `In`, `NotIn` and `AnyLike` style operators need at least one value
    #[error("value for {op:?} operator cannot be empty")]
    EmptyValueList { op: Operator },

    /// Bulk updates may not touch the primary key
    #[error("updating the primary key is not allowed")]
    KeyUpdateNotAllowed,

    /// Value type cannot be used by the operation
    #[error("unsupported data type {data_type} on {operation}")]
    UnsupportedType {
        operation: &'static str,
        data_type: &'static str,
    },

    /// Operator string could not be parsed
    #[error("invalid operator {0:?}")]
    InvalidOperator(String),

    /// Model exposes no compatible key field
    #[error("entity {kind:?} has no primary key property")]
    MissingPrimaryKey { kind: String },

    /// Update targeted a nil or incomplete key
    #[error("invalid key value {key}")]
    InvalidKey { key: String },

    /// Delete targeted a row without a complete key
    #[error("entity {kind:?} has incomplete key")]
    IncompleteKey { kind: String },

    /// No table could be resolved for the operation
    #[error("missing table name")]
    MissingTable,

    /// Feature not available for the active dialect
    #[error("{feature} is not supported by the {dialect} dialect")]
    Unsupported {
        feature: &'static str,
        dialect: &'static str,
    },

    /// No dialect registered under this driver name
    #[error("unsupported database driver {0:?}")]
    UnsupportedDriver(String),

    /// Connected server is older than the dialect's floor
    #[error("{driver} requires at least version {minimum}, found {found}")]
    UnsupportedVersion {
        driver: &'static str,
        minimum: &'static str,
        found: String,
    },

    /// Server did not answer the initial ping
    #[error("{driver} server has not responded: {message}")]
    Unreachable { driver: String, message: String },

    /// Connection cannot begin a transaction
    #[error("connection does not support transactions")]
    TransactionUnsupported,

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Driver or engine failure
    #[error("{operation}: {message}")]
    Backend { operation: String, message: String },
}

/// Result type for quarry operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a driver failure with the name of the operation that issued it
    pub fn backend(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Prefix a backend error with the operation that surfaced it
    pub(crate) fn context(self, operation: &str) -> Self {
        match self {
            Self::Backend {
                operation: inner,
                message,
            } if inner.is_empty() => Self::Backend {
                operation: operation.to_string(),
                message,
            },
            Self::Backend {
                operation: inner,
                message,
            } => Self::Backend {
                operation: format!("{}: {}", operation, inner),
                message,
            },
            other => other,
        }
    }

    /// True when the error signals an empty result rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

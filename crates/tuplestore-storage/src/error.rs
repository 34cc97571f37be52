//! Storage error types.
//!
//! Every backend translates its native failures into [`StorageError`] before a
//! value leaves this crate. Callers above the storage layer only ever match on
//! the variants below.

use std::time::Duration;

use thiserror::Error;

use crate::traits::{TupleKey, TupleOperation};

/// Boxed error used to carry a backend cause through [`StorageError::Wrapped`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A point lookup matched no row.
    #[error("not found")]
    NotFound,

    /// A write violated tuple uniqueness, or a delete targeted a missing tuple.
    #[error("{}", invalid_write_message(.tuple_key, .operation))]
    InvalidWriteInput {
        tuple_key: TupleKey,
        operation: TupleOperation,
    },

    /// The continuation token could not be decoded.
    #[error("invalid continuation token")]
    InvalidContinuationToken,

    /// A query exceeded its configured timeout.
    #[error("{operation} timed out after {timeout:?}")]
    QueryTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Internal invariant violation inside the storage layer.
    #[error("internal storage error: {message}")]
    Internal { message: String },

    /// Any other backend failure, with the original cause preserved.
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: BoxError,
    },
}

fn invalid_write_message(tuple_key: &TupleKey, operation: &TupleOperation) -> String {
    match operation {
        TupleOperation::Write => {
            format!("cannot write a tuple which already exists: {tuple_key}")
        }
        TupleOperation::Delete => {
            format!("cannot delete a tuple which does not exist: {tuple_key}")
        }
    }
}

impl StorageError {
    /// Wraps an arbitrary backend error, keeping it as the source.
    pub fn wrap(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        StorageError::Wrapped {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StorageError::Internal {
            message: message.into(),
        }
    }

    /// Returns true for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Translates a driver error raised outside a write.
pub(crate) fn map_sqlx_error(err: sqlx::Error, context: &str) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        other => StorageError::wrap(context, other),
    }
}

/// Translates a driver error raised while applying `operation` to `tuple_key`.
///
/// Uniqueness violations become [`StorageError::InvalidWriteInput`]; anything
/// else falls through to [`map_sqlx_error`].
pub(crate) fn map_write_error(
    err: sqlx::Error,
    tuple_key: &TupleKey,
    operation: TupleOperation,
) -> StorageError {
    if is_duplicate_key(&err) {
        return StorageError::InvalidWriteInput {
            tuple_key: tuple_key.clone(),
            operation,
        };
    }
    map_sqlx_error(err, "failed to write tuple")
}

/// Postgres reports SQLSTATE 23505 and MySQL error 1062 for a duplicate key;
/// both surface through the driver as a unique violation.
fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Health status returned by [`crate::DataStore::health_check`].
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency: Duration,
    pub pool_stats: Option<PoolStats>,
    pub message: Option<String>,
}

/// Connection pool statistics for SQL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
}

//! Error types for the PostgreSQL job store.

use bulkport_storage::StorageError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for foreign key violations (23503).
pub const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL error code raised when `lock_timeout` expires (55P03).
pub const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Errors specific to the PostgreSQL backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Error reported by the driver or the database.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::error::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Database(e) => match e {
                SqlxError::Database(db) => StorageError::internal(db.to_string()),
                SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => {
                    StorageError::serialization(e.to_string())
                }
                other => StorageError::connection_error(other.to_string()),
            },
            PostgresError::Migration(e) => StorageError::internal(format!("Migration error: {e}")),
            PostgresError::Config { message } => {
                StorageError::internal(format!("Configuration error: {message}"))
            }
        }
    }
}

/// Converts a driver error straight into a [`StorageError`].
pub(crate) fn db_err(err: SqlxError) -> StorageError {
    PostgresError::from(err).into()
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

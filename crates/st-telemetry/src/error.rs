//! Storage errors.

use thiserror::Error;

/// Result type for schema and backend operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors from schema construction and database backends.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("conflicting definitions for table '{0}'")]
    ConflictingTable(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    #[error("record for table '{table}' is {actual} bytes, expected {expected}")]
    RecordSize {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid value for column '{column}': {message}")]
    InvalidValue { column: String, message: String },

    #[error("database is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl DbError {
    /// Stable numeric code; shares the database range of `st_common::Error`.
    pub fn code(&self) -> u32 {
        match self {
            DbError::InvalidSchema(_) => 30,
            DbError::ConflictingTable(_) => 31,
            DbError::UnknownTable(_) => 32,
            DbError::UnknownColumn { .. } => 33,
            DbError::Unsupported(_) => 34,
            DbError::RecordSize { .. } => 35,
            DbError::InvalidValue { .. } => 36,
            DbError::NotConnected => 37,
            DbError::Io(_) => 38,
            DbError::Arrow(_) | DbError::Parquet(_) => 39,
        }
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        DbError::InvalidSchema(msg.into())
    }
}

impl From<DbError> for st_common::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Io(io) => st_common::Error::Io(io),
            other => st_common::Error::Db(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_db_category() {
        let err: st_common::Error = DbError::UnknownTable("T".into()).into();
        assert_eq!(err.category(), st_common::ErrorCategory::Database);
        assert!(err.to_string().contains("T"));
    }

    #[test]
    fn test_io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro");
        let err: st_common::Error = DbError::Io(io).into();
        assert_eq!(err.category(), st_common::ErrorCategory::Io);
    }
}

//! Error types for the simulation telemetry core.
//!
//! Every fallible operation in the workspace eventually surfaces one of the
//! variants below. Crate-local error enums (schema validation, definition
//! parsing) convert into [`Error`] through `From` impls so callers can use `?`
//! across crate boundaries.
//!
//! Errors carry:
//! - A stable numeric code for machine parsing
//! - A category for grouping related failures
//! - A recoverability hint for hosts driving long simulations

use crate::Tick;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Statistic window and evaluation errors.
    Statistic,
    /// Expression, trigger and document parse errors.
    Parse,
    /// Schema, validation and storage backend errors.
    Database,
    /// Trigger registration and scheduling errors.
    Trigger,
    /// Report configuration errors.
    Config,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Statistic => write!(f, "statistic"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::Database => write!(f, "database"),
            ErrorCategory::Trigger => write!(f, "trigger"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the telemetry core.
#[derive(Error, Debug)]
pub enum Error {
    // Statistic errors (10-19)
    #[error("reversed statistic range: end tick {end} precedes start tick {start}")]
    ReversedStatisticRange { start: Tick, end: Tick },

    #[error("future statistic range: window ends at tick {end} but the scheduler is at tick {current}")]
    FutureStatisticRange { end: Tick, current: Tick },

    #[error("statistic source expired: {0}")]
    ExpiredReference(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("cannot construct statistic: {0}")]
    Construction(String),

    // Parse errors (20-29)
    #[error("parse error: {0}")]
    Parse(String),

    // Database errors (30-39)
    #[error("database error: {0}")]
    Db(String),

    // Trigger errors (40-49)
    #[error("trigger error: {0}")]
    Trigger(String),

    // Config errors (50-59)
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns the stable error code for this error.
    ///
    /// - 10-19: Statistic errors
    /// - 20-29: Parse errors
    /// - 30-39: Database errors
    /// - 40-49: Trigger errors
    /// - 50-59: Configuration errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::ReversedStatisticRange { .. } => 10,
            Error::FutureStatisticRange { .. } => 11,
            Error::ExpiredReference(_) => 12,
            Error::IllegalOperation(_) => 13,
            Error::Construction(_) => 14,
            Error::Parse(_) => 20,
            Error::Db(_) => 30,
            Error::Trigger(_) => 40,
            Error::Config(_) => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Yaml(_) => 62,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ReversedStatisticRange { .. }
            | Error::FutureStatisticRange { .. }
            | Error::ExpiredReference(_)
            | Error::IllegalOperation(_)
            | Error::Construction(_) => ErrorCategory::Statistic,

            Error::Parse(_) => ErrorCategory::Parse,
            Error::Db(_) => ErrorCategory::Database,
            Error::Trigger(_) => ErrorCategory::Trigger,
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) | Error::Yaml(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether a host can reasonably continue after this error.
    ///
    /// Window errors are tied to a scheduler rewind and clear up once the
    /// statistic is restarted; parse and schema failures need the
    /// definition to be fixed first.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ReversedStatisticRange { .. } | Error::FutureStatisticRange { .. } => true,
            Error::ExpiredReference(_) => false,
            Error::IllegalOperation(_) => false,
            Error::Construction(_) => false,
            Error::Parse(_) => false,
            Error::Db(_) => false,
            Error::Trigger(_) => false,
            Error::Config(_) => false,
            Error::Io(_) => true,
            Error::Json(_) | Error::Yaml(_) => false,
        }
    }

    /// Shorthand for a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Shorthand for a database error.
    pub fn db(msg: impl Into<String>) -> Self {
        Error::Db(msg.into())
    }

    /// Shorthand for a trigger error.
    pub fn trigger(msg: impl Into<String>) -> Self {
        Error::Trigger(msg.into())
    }

    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_grouped() {
        let err = Error::ReversedStatisticRange { start: 10, end: 2 };
        assert_eq!(err.code(), 10);
        assert_eq!(err.category(), ErrorCategory::Statistic);

        let err = Error::parse("bad token");
        assert_eq!(err.code(), 20);
        assert_eq!(err.category(), ErrorCategory::Parse);

        let err = Error::db("no such table");
        assert_eq!(err.code(), 30);
        assert_eq!(err.category(), ErrorCategory::Database);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::FutureStatisticRange { end: 50, current: 10 };
        let msg = err.to_string();
        assert!(msg.contains("50"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.category(), ErrorCategory::Io);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Database.to_string(), "database");
        assert_eq!(ErrorCategory::Trigger.to_string(), "trigger");
    }
}

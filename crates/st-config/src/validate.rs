//! Document validation errors.

use thiserror::Error;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Report document validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown key '{key}' in {context} block")]
    UnknownKey { key: String, context: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 51,
            ValidationError::MissingField(_) => 52,
            ValidationError::InvalidValue { .. } => 53,
            ValidationError::UnknownKey { .. } => 54,
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for ValidationError {
    fn from(err: serde_yaml::Error) -> Self {
        ValidationError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for ValidationError {
    fn from(err: std::io::Error) -> Self {
        ValidationError::IoError(err.to_string())
    }
}

impl From<ValidationError> for st_common::Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::ParseError(msg) => st_common::Error::Parse(msg),
            other => st_common::Error::Config(other.to_string()),
        }
    }
}

/// Render a scalar YAML node as a string. Sequences and mappings are rejected.
pub(crate) fn scalar_string(value: &serde_yaml::Value, field: &str) -> ValidationResult<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(ValidationError::invalid(field, "expected a scalar value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ValidationError::MissingField("name".into()).code(), 52);
        assert_eq!(ValidationError::invalid("x", "y").code(), 53);
    }

    #[test]
    fn test_parse_error_maps_to_parse_category() {
        let err: st_common::Error = ValidationError::ParseError("bad".into()).into();
        assert_eq!(err.category(), st_common::ErrorCategory::Parse);
        let err: st_common::Error = ValidationError::MissingField("pattern".into()).into();
        assert_eq!(err.category(), st_common::ErrorCategory::Config);
    }

    #[test]
    fn test_scalar_string() {
        let v: serde_yaml::Value = serde_yaml::from_str("42").unwrap();
        assert_eq!(scalar_string(&v, "f").unwrap(), "42");
        let v: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        assert!(scalar_string(&v, "f").is_err());
    }
}

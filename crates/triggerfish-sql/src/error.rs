//! Error types for triggerfish-sql
//!
//! Two families of failure exist at definition time:
//! - [`ValidationError`] for missing or inconsistent trigger specification fields
//! - [`Error::UnsupportedExpression`] when a predicate falls outside the compilable grammar
//!
//! Both are raised before any DDL is produced.

use thiserror::Error;

/// Result type for triggerfish-sql operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for triggerfish-sql
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Trigger specification is incomplete or inconsistent
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Predicate cannot be reduced to the supported grammar
    #[error("unsupported expression: {reason}")]
    UnsupportedExpression { reason: String },
}

impl Error {
    /// Create an unsupported expression error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedExpression {
            reason: reason.into(),
        }
    }

    /// Whether this is a specification validation failure
    #[inline]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Whether this is a predicate compilation failure
    #[inline]
    pub fn is_unsupported_expression(&self) -> bool {
        matches!(self, Self::UnsupportedExpression { .. })
    }
}

/// Mandatory trigger specification fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RequiredField {
    Model,
    Name,
    Timing,
    Operations,
    Function,
}

impl std::fmt::Display for RequiredField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Name => write!(f, "trigger name"),
            Self::Timing => write!(f, "timing"),
            Self::Operations => write!(f, "operations"),
            Self::Function => write!(f, "target function"),
        }
    }
}

/// Specification validation failures
#[derive(Error, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(RequiredField),

    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("invalid channel name '{name}': {reason}")]
    InvalidChannel { name: String, reason: String },

    #[error("watched columns require UPDATE among the trigger operations")]
    WatchedColumnsRequireUpdate,

    #[error("TRUNCATE triggers must be FOR EACH STATEMENT")]
    TruncateRequiresStatementLevel,

    #[error("INSTEAD OF triggers must be FOR EACH ROW")]
    InsteadOfRequiresRowLevel,

    #[error("INSTEAD OF triggers cannot have a {0}")]
    InsteadOfRestriction(&'static str),

    #[error("a WHEN condition requires a FOR EACH ROW trigger")]
    ConditionRequiresRowLevel,

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{model}' has no field '{column}'")]
    UnknownColumn { model: String, column: String },

    #[error("field '{column}' of type {expected} cannot be compared with {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("trigger '{name}' already defined on {schema}.{table}")]
    DuplicateTrigger {
        schema: String,
        table: String,
        name: String,
    },
}

impl ValidationError {
    /// Create an invalid identifier error
    pub fn identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid channel error
    pub fn channel(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChannel {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display() {
        let err: Error = ValidationError::MissingField(RequiredField::Timing).into();
        assert_eq!(err.to_string(), "missing required field: timing");
        assert!(err.is_validation());
    }

    #[test]
    fn test_unsupported_display() {
        let err = Error::unsupported("method call 'toLowerCase'");
        assert!(err.to_string().contains("toLowerCase"));
        assert!(err.is_unsupported_expression());
        assert!(!err.is_validation());
    }
}

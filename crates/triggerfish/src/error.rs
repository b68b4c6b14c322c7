//! Error types for triggerfish
//!
//! Errors are classified so callers can tell what to do with them:
//! - Definition errors (validation, unsupported expression) fail before any DDL
//! - Transport errors are retriable and drive listener reconnection
//! - Runtime dispatch errors never reach the caller; see [`crate::multiplexer`]

use std::fmt;
use thiserror::Error;

pub use triggerfish_sql::ValidationError;

/// Result type for triggerfish operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by notification handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Trigger specification problems (not retriable)
    Validation,
    /// Predicate outside the compilable grammar (not retriable)
    UnsupportedExpression,
    /// Malformed notification payload
    Payload,
    /// A handler failed
    Handler,
    /// Connection or LISTEN/UNLISTEN round-trip failure (retriable)
    Transport,
    /// SQL execution failure
    Query,
    /// Transaction control failure
    Transaction,
    /// Operation timed out (retriable)
    Timeout,
    /// Configuration problems
    Configuration,
    /// Lifecycle ordering problems
    State,
    /// Component already torn down
    Disposed,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::UnsupportedExpression => write!(f, "unsupported_expression"),
            Self::Payload => write!(f, "payload"),
            Self::Handler => write!(f, "handler"),
            Self::Transport => write!(f, "transport"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::State => write!(f, "state"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Main error type for triggerfish
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Trigger specification failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Condition cannot be compiled
    #[error("unsupported expression: {reason}")]
    UnsupportedExpression { reason: String },

    /// Notification payload is not a valid envelope
    #[error("malformed payload on channel '{channel}': {message}")]
    PayloadParse { channel: String, message: String },

    /// A notification handler failed
    #[error("handler {handler} failed on channel '{channel}': {message}")]
    Handler {
        handler: String,
        channel: String,
        message: String,
    },

    /// Listener connection or subscription round-trip failed
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction control failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation requires `setup()` first
    #[error("trigger '{trigger}' is not set up")]
    NotSetup { trigger: String },

    /// No trigger with this key is registered
    #[error("unknown trigger '{trigger}'")]
    UnknownTrigger { trigger: String },

    /// Operation not valid in the trigger's current state
    #[error("cannot {operation} trigger '{trigger}' in state {state}")]
    InvalidState {
        trigger: String,
        state: String,
        operation: &'static str,
    },

    /// Component was disposed
    #[error("{component} has been disposed")]
    Disposed { component: &'static str },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::UnsupportedExpression { .. } => ErrorCategory::UnsupportedExpression,
            Self::PayloadParse { .. } => ErrorCategory::Payload,
            Self::Handler { .. } => ErrorCategory::Handler,
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::NotSetup { .. } | Self::InvalidState { .. } => ErrorCategory::State,
            Self::UnknownTrigger { .. } => ErrorCategory::Configuration,
            Self::Disposed { .. } => ErrorCategory::Disposed,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the component was disposed
    #[inline]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a disposed error
    pub fn disposed(component: &'static str) -> Self {
        Self::Disposed { component }
    }
}

impl From<triggerfish_sql::Error> for Error {
    fn from(err: triggerfish_sql::Error) -> Self {
        match err {
            triggerfish_sql::Error::Validation(v) => Self::Validation(v),
            triggerfish_sql::Error::UnsupportedExpression { reason } => {
                Self::UnsupportedExpression { reason }
            }
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            Self::transport_with_source("connection closed", err)
        } else {
            Self::Query {
                message: err.to_string(),
                sql: None,
                source: Some(Box::new(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triggerfish_sql::error::RequiredField;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Transport.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Validation.is_retriable());
        assert!(!ErrorCategory::Disposed.is_retriable());
        assert!(!ErrorCategory::Payload.is_retriable());
    }

    #[test]
    fn test_from_sql_error() {
        let err: Error = triggerfish_sql::Error::unsupported("x").into();
        assert_eq!(err.category(), ErrorCategory::UnsupportedExpression);

        let err: Error =
            triggerfish_sql::Error::from(ValidationError::MissingField(RequiredField::Model))
                .into();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.to_string(), "missing required field: model");
    }

    #[test]
    fn test_error_display() {
        let err = Error::disposed("connection manager");
        assert_eq!(err.to_string(), "connection manager has been disposed");
        assert!(err.is_disposed());

        let err = Error::InvalidState {
            trigger: "public.orders.t".into(),
            state: "Dropped".into(),
            operation: "listen",
        };
        assert_eq!(
            err.to_string(),
            "cannot listen trigger 'public.orders.t' in state Dropped"
        );
    }
}

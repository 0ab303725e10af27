//! Error types for dbpilot
//!
//! Provides granular failure classification for proper retry handling:
//! - Transient failures (driver blips, deadlocks, per-attempt timeouts)
//! - Fail-fast rejections (configuration, overload, open circuit)
//! - Terminal states (cancellation, disposal, conversion failures)

use std::fmt;
use thiserror::Error;

/// Result type for dbpilot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or missing configuration (not retried)
    Configuration,
    /// Wrapped driver error matching the transient predicate (retried)
    Transient,
    /// Per-attempt timeout (retried)
    Timeout,
    /// Bulkhead or rate-limiter rejection (not retried)
    Overloaded,
    /// Fail-fast rejection while the circuit breaker is open (not retried)
    CircuitOpen,
    /// Scalar coercion failure (not retried)
    InvalidConversion,
    /// Top-level or per-attempt cancellation (not retried)
    Cancelled,
    /// Call after executor shutdown
    Disposed,
    /// Non-transient driver failure, surfaced as-is
    Unknown,
}

impl ErrorCategory {
    /// Whether errors in this category are retried by the pipeline
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transient => write!(f, "transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::InvalidConversion => write!(f, "invalid_conversion"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Disposed => write!(f, "disposed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Main error type for dbpilot
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Unknown connection name, blank connection string, invalid options
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Driver failure classified as retryable
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Per-attempt timeout enforced by the resilience pipeline
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Bulkhead or rate-limiter rejection
    #[error("overloaded: {message}")]
    Overloaded { message: String },

    /// Circuit breaker is open
    #[error("circuit open: {message}")]
    CircuitOpen { message: String },

    /// Scalar coercion failed
    #[error("invalid conversion: {message}")]
    InvalidConversion { message: String },

    /// Execution was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Call after the executor was disposed
    #[error("executor disposed")]
    Disposed,

    /// Non-transient driver failure
    #[error("database error: {message}")]
    Unknown {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Overloaded { .. } => ErrorCategory::Overloaded,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::InvalidConversion { .. } => ErrorCategory::InvalidConversion,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Disposed => ErrorCategory::Disposed,
            Self::Unknown { .. } => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is retried by the pipeline's retry policy
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error with source
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an overloaded error
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded {
            message: message.into(),
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::CircuitOpen {
            message: message.into(),
        }
    }

    /// Create an invalid-conversion error
    pub fn invalid_conversion(message: impl Into<String>) -> Self {
        Self::InvalidConversion {
            message: message.into(),
        }
    }

    /// Create an unknown driver error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unknown driver error with source
    pub fn unknown_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unknown {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Append connection name and redacted command text to the message of
    /// message-bearing variants. Parameter values are never included.
    pub(crate) fn with_query_context(self, connection_name: &str, command_text: &str) -> Self {
        let context = format!(
            " (connection={}, command={})",
            connection_name,
            redact_command_text(command_text)
        );
        match self {
            Self::Transient { message, source } => Self::Transient {
                message: message + &context,
                source,
            },
            Self::Timeout { message } => Self::Timeout {
                message: message + &context,
            },
            Self::Unknown { message, source } => Self::Unknown {
                message: message + &context,
                source,
            },
            other => other,
        }
    }
}

/// Maximum command-text length carried into error messages and logs.
const REDACTED_TEXT_MAX: usize = 120;

/// Collapse whitespace and truncate command text for diagnostics.
///
/// Parameter values never pass through here; only the statement text does.
pub fn redact_command_text(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len().min(REDACTED_TEXT_MAX + 1));
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !collapsed.is_empty() {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(ch);
            last_was_space = false;
        }
        if collapsed.len() > REDACTED_TEXT_MAX {
            break;
        }
    }
    if collapsed.len() > REDACTED_TEXT_MAX {
        let mut end = REDACTED_TEXT_MAX;
        while !collapsed.is_char_boundary(end) {
            end -= 1;
        }
        collapsed.truncate(end);
        collapsed.push('…');
    }
    collapsed
}

/// Pluggable predicate deciding which failures the retry policy and circuit
/// breaker treat as transient.
pub trait TransientClassifier: Send + Sync {
    /// Whether the given error should be retried
    fn is_transient(&self, error: &Error) -> bool;
}

/// Default classifier: driver-reported transient failures plus per-attempt
/// timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransientClassifier;

impl TransientClassifier for DefaultTransientClassifier {
    fn is_transient(&self, error: &Error) -> bool {
        error.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_transient() {
        assert!(ErrorCategory::Transient.is_transient());
        assert!(ErrorCategory::Timeout.is_transient());

        assert!(!ErrorCategory::Configuration.is_transient());
        assert!(!ErrorCategory::Overloaded.is_transient());
        assert!(!ErrorCategory::CircuitOpen.is_transient());
        assert!(!ErrorCategory::InvalidConversion.is_transient());
        assert!(!ErrorCategory::Cancelled.is_transient());
        assert!(!ErrorCategory::Disposed.is_transient());
        assert!(!ErrorCategory::Unknown.is_transient());
    }

    #[test]
    fn test_error_is_transient() {
        assert!(Error::transient("connection reset").is_transient());
        assert!(Error::timeout("attempt exceeded 5s").is_transient());

        assert!(!Error::config("missing connection string").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::unknown("syntax error").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::config("blank connection string for \"reports\"");
        assert!(err.to_string().contains("reports"));

        let err = Error::circuit_open("breaker open for defaultDatabase");
        assert!(err.to_string().starts_with("circuit open"));
    }

    #[test]
    fn test_redact_collapses_whitespace() {
        let text = "SELECT *\n  FROM   users\n WHERE id = @id";
        assert_eq!(
            redact_command_text(text),
            "SELECT * FROM users WHERE id = @id"
        );
    }

    #[test]
    fn test_redact_truncates_long_text() {
        let text = "SELECT ".to_string() + &"x, ".repeat(200);
        let redacted = redact_command_text(&text);
        assert!(redacted.chars().count() <= REDACTED_TEXT_MAX + 1);
        assert!(redacted.ends_with('…'));
    }

    #[test]
    fn test_query_context_annotation() {
        let err = Error::transient("deadlock").with_query_context("reports", "SELECT 1");
        let msg = err.to_string();
        assert!(msg.contains("connection=reports"));
        assert!(msg.contains("SELECT 1"));

        // Unit-like variants pass through untouched
        let err = Error::Cancelled.with_query_context("reports", "SELECT 1");
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_default_classifier() {
        let classifier = DefaultTransientClassifier;
        assert!(classifier.is_transient(&Error::transient("blip")));
        assert!(classifier.is_transient(&Error::timeout("slow")));
        assert!(!classifier.is_transient(&Error::Cancelled));
        assert!(!classifier.is_transient(&Error::overloaded("queue full")));
    }
}

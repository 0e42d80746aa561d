use crate::remote::error_code::{RemoteError, RemoteErrorCode};
use crate::transport::TransportError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "remote.batch_size")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "sqlite_dedupe", "circuit_breaker")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the client and its stores.
///
/// Misses (absent or expired entries, unknown dedupe jobs) are never errors; they
/// surface as `Ok(None)` from the store traits.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Item of {size} bytes exceeds the {limit} byte item limit")]
    ItemTooLarge { size: usize, limit: usize },

    #[error("Throttled on {operation} after {attempts} attempts")]
    ThrottlingExhausted { operation: String, attempts: u32 },

    #[error("Circuit breaker open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    #[error("Store {store} has been destroyed")]
    StoreDestroyed { store: &'static str },

    #[error("Timed out waiting for in-flight request {key}")]
    DedupeTimeout { key: String },

    #[error("Rate limit exceeded for {resource}, retry in {wait_ms}ms")]
    RateLimited { resource: String, wait_ms: u64 },

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new runtime error without context
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Remote error code, if this error came back from the remote table.
    pub fn remote_code(&self) -> Option<RemoteErrorCode> {
        match self {
            Error::Remote(e) => Some(e.code),
            _ => None,
        }
    }

    /// Infrastructure failures that count toward a circuit breaker.
    pub fn is_severe(&self) -> bool {
        match self {
            Error::Remote(e) => e.code.severe(),
            Error::OperationTimeout { .. } => true,
            Error::Transport(TransportError::Http(e)) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_throttling(&self) -> bool {
        matches!(self, Error::Remote(e) if e.code.throttling())
    }

    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Remote(e) => e.code.retryable(),
            Error::OperationTimeout { .. } => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Conditional-write collisions on the remote table.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Remote(e) if e.code == RemoteErrorCode::ConditionalCheckFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "batch size out of range",
            ErrorContext::new()
                .with_field_path("remote.batch_size")
                .with_source("remote_config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: batch size out of range (field: remote.batch_size, source: remote_config)"
        );
        assert!(err.context().is_some());
    }

    #[test]
    fn test_classification() {
        let throttled = Error::Remote(RemoteError::new(
            RemoteErrorCode::ProvisionedThroughputExceeded,
            "slow down",
        ));
        assert!(throttled.is_throttling());
        assert!(throttled.is_retryable());
        assert!(throttled.is_severe());

        let invalid = Error::Remote(RemoteError::new(RemoteErrorCode::Validation, "bad key"));
        assert!(!invalid.is_severe());
        assert!(!invalid.is_retryable());

        let conflict = Error::Remote(RemoteError::new(
            RemoteErrorCode::ConditionalCheckFailed,
            "exists",
        ));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_severe());

        assert!(Error::OperationTimeout {
            operation: "get_item".into(),
            timeout_ms: 10
        }
        .is_severe());
        assert!(!Error::StoreDestroyed { store: "memory_cache" }.is_severe());
    }
}

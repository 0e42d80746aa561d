//! Remote table error codes and their retry / circuit-breaker semantics.
//!
//! ## Error Code Categories
//!
//! | Category    | Codes                                                    |
//! |-------------|----------------------------------------------------------|
//! | client      | validation, item too large, resource not found           |
//! | conflict    | conditional check failed, transaction conflict           |
//! | throttling  | provisioned throughput exceeded, throttling, request limit |
//! | server      | internal server error, service unavailable               |
//! | network     | connection timeout, connection reset                     |
//! | unknown     | catch-all                                                |
//!
//! ```rust
//! use comic_vine::remote::error_code::RemoteErrorCode;
//!
//! let code = RemoteErrorCode::from_code("ThrottlingException");
//! assert!(code.retryable());
//! assert!(code.severe());
//! assert_eq!(code.category(), "throttling");
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    /// Malformed request or key schema mismatch
    Validation,
    /// Item exceeds the table's per-item size ceiling
    ItemTooLarge,
    /// Table or index does not exist
    ResourceNotFound,
    /// A conditional write found the condition false
    ConditionalCheckFailed,
    /// Concurrent transaction touched the same item
    TransactionConflict,
    /// Provisioned capacity exceeded for the table or index
    ProvisionedThroughputExceeded,
    /// Control-plane or account level throttling
    Throttling,
    /// Account request rate limit exceeded
    RequestLimitExceeded,
    /// Internal failure on the service side
    InternalServerError,
    /// Service temporarily unavailable
    ServiceUnavailable,
    /// Network timeout before a response was received
    ConnectionTimeout,
    /// Connection reset by peer
    ConnectionReset,
    /// Could not be classified
    Unknown,
}

impl RemoteErrorCode {
    /// Returns the wire name used by the service (e.g. `"ThrottlingException"`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationException",
            Self::ItemTooLarge => "ItemCollectionSizeLimitExceededException",
            Self::ResourceNotFound => "ResourceNotFoundException",
            Self::ConditionalCheckFailed => "ConditionalCheckFailedException",
            Self::TransactionConflict => "TransactionConflictException",
            Self::ProvisionedThroughputExceeded => "ProvisionedThroughputExceededException",
            Self::Throttling => "ThrottlingException",
            Self::RequestLimitExceeded => "RequestLimitExceeded",
            Self::InternalServerError => "InternalServerError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::ConnectionTimeout => "TimeoutError",
            Self::ConnectionReset => "ECONNRESET",
            Self::Unknown => "Unknown",
        }
    }

    pub fn throttling(&self) -> bool {
        matches!(
            self,
            Self::ProvisionedThroughputExceeded | Self::Throttling | Self::RequestLimitExceeded
        )
    }

    /// Whether this error is worth another attempt after a backoff.
    pub fn retryable(&self) -> bool {
        self.throttling()
            || matches!(
                self,
                Self::InternalServerError
                    | Self::ServiceUnavailable
                    | Self::ConnectionTimeout
                    | Self::ConnectionReset
                    | Self::TransactionConflict
            )
    }

    /// Whether this error counts toward a circuit breaker's failure threshold.
    pub fn severe(&self) -> bool {
        self.throttling()
            || matches!(
                self,
                Self::InternalServerError
                    | Self::ServiceUnavailable
                    | Self::ConnectionTimeout
                    | Self::ConnectionReset
            )
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation | Self::ItemTooLarge | Self::ResourceNotFound => "client",
            Self::ConditionalCheckFailed | Self::TransactionConflict => "conflict",
            Self::ProvisionedThroughputExceeded | Self::Throttling | Self::RequestLimitExceeded => {
                "throttling"
            }
            Self::InternalServerError | Self::ServiceUnavailable => "server",
            Self::ConnectionTimeout | Self::ConnectionReset => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Maps a service error code/type string to a `RemoteErrorCode`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ValidationException" => Self::Validation,
            "ItemCollectionSizeLimitExceededException" => Self::ItemTooLarge,
            "ResourceNotFoundException" => Self::ResourceNotFound,
            "ConditionalCheckFailedException" => Self::ConditionalCheckFailed,
            "TransactionConflictException" => Self::TransactionConflict,
            "ProvisionedThroughputExceededException" => Self::ProvisionedThroughputExceeded,
            "ThrottlingException" => Self::Throttling,
            "RequestLimitExceeded" => Self::RequestLimitExceeded,
            "InternalServerError" | "InternalFailure" => Self::InternalServerError,
            "ServiceUnavailable" | "ServiceUnavailableException" => Self::ServiceUnavailable,
            "TimeoutError" | "ETIMEDOUT" | "RequestTimeout" => Self::ConnectionTimeout,
            "ECONNRESET" | "NetworkingError" => Self::ConnectionReset,
            _ => Self::Unknown,
        }
    }

    /// Maps an HTTP status code to the most likely `RemoteErrorCode`.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::Validation,
            404 => Self::ResourceNotFound,
            408 => Self::ConnectionTimeout,
            409 => Self::ConditionalCheckFailed,
            413 => Self::ItemTooLarge,
            420 | 429 => Self::Throttling,
            500 => Self::InternalServerError,
            502..=504 => Self::ServiceUnavailable,
            _ => Self::Unknown,
        }
    }

    /// Maps the Comic Vine envelope `status_code` to a `RemoteErrorCode`.
    ///
    /// `1` means OK and yields `None`.
    pub fn from_api_status(status_code: i64) -> Option<Self> {
        match status_code {
            1 => None,
            100 | 102 | 103 | 104 | 105 => Some(Self::Validation),
            101 => Some(Self::ResourceNotFound),
            107 => Some(Self::RequestLimitExceeded),
            _ => Some(Self::Unknown),
        }
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An error reported by the remote table (or by the upstream API).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_is_retryable_and_severe() {
        for code in [
            RemoteErrorCode::ProvisionedThroughputExceeded,
            RemoteErrorCode::Throttling,
            RemoteErrorCode::RequestLimitExceeded,
        ] {
            assert!(code.throttling());
            assert!(code.retryable());
            assert!(code.severe());
        }
    }

    #[test]
    fn test_client_errors_pass_through() {
        for code in [
            RemoteErrorCode::Validation,
            RemoteErrorCode::ItemTooLarge,
            RemoteErrorCode::ConditionalCheckFailed,
        ] {
            assert!(!code.retryable(), "{code} should not retry");
            assert!(!code.severe(), "{code} should not trip the breaker");
        }
    }

    #[test]
    fn test_transaction_conflict_retries_without_tripping() {
        let code = RemoteErrorCode::TransactionConflict;
        assert!(code.retryable());
        assert!(!code.severe());
    }

    #[test]
    fn test_from_code_round_trips_names() {
        for code in [
            RemoteErrorCode::Validation,
            RemoteErrorCode::ConditionalCheckFailed,
            RemoteErrorCode::Throttling,
            RemoteErrorCode::ServiceUnavailable,
            RemoteErrorCode::ConnectionReset,
        ] {
            assert_eq!(RemoteErrorCode::from_code(code.name()), code);
        }
        assert_eq!(RemoteErrorCode::from_code("Whatever"), RemoteErrorCode::Unknown);
    }

    #[test]
    fn test_http_and_api_status() {
        assert_eq!(RemoteErrorCode::from_http_status(420), RemoteErrorCode::Throttling);
        assert_eq!(RemoteErrorCode::from_http_status(503), RemoteErrorCode::ServiceUnavailable);
        assert_eq!(RemoteErrorCode::from_api_status(1), None);
        assert_eq!(
            RemoteErrorCode::from_api_status(101),
            Some(RemoteErrorCode::ResourceNotFound)
        );
        assert_eq!(
            RemoteErrorCode::from_api_status(107),
            Some(RemoteErrorCode::RequestLimitExceeded)
        );
    }
}

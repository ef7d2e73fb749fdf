//! Error types for queue operations.
//!
//! This module provides:
//! - `QueueError` - The main error type for queue operations
//! - `ErrorCategory` - Classification of errors for retry decisions

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// AMQP connection or protocol error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Interval string did not match `^\d+(ms|s|m|h|d)$`.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Backoff options were malformed.
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),

    /// A non-terminal job with the same id already exists.
    #[error("Job already exists: {0}")]
    JobExists(String),

    /// No job with the given id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// No queue registered under the given broker and name.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A processor is already registered for this (queue, name) pair.
    #[error("Processor already registered: {0}")]
    ProcessorExists(String),

    /// The requested feature is not implemented by this backend.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level connection failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation or processor exceeded its time budget.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Job processing error from the processor.
    #[error("Processing error: {0}")]
    Processing(String),

    /// The operation was cancelled (batch cancelled, queue closed).
    /// Reported as a distinct outcome, not a failure.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The queue has been closed.
    #[error("Queue is closed")]
    Closed,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Check if this is a connection-related error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            Self::Amqp(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("closed")
                    || err_str.contains("refused")
                    || err_str.contains("io error")
            }
            Self::Connection(_) => true,
            Self::Internal(s) => s.to_lowercase().contains("connection"),
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timeout") || err_str.contains("timed out")
            }
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Check if this outcome is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Closed)
    }

    /// Categorize the error for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            // Transport errors are transient - the backend reconnects
            Self::Redis(_) | Self::Amqp(_) | Self::Connection(_) => ErrorCategory::Transient,

            // Timeouts are transient
            Self::Timeout(_) => ErrorCategory::Transient,

            // Bad data and bad configuration do not improve with retries
            Self::Serialization(_)
            | Self::InvalidInterval(_)
            | Self::InvalidBackoff(_)
            | Self::Config(_)
            | Self::NotSupported(_)
            | Self::JobExists(_)
            | Self::JobNotFound(_)
            | Self::QueueNotFound(_)
            | Self::ProcessorExists(_) => ErrorCategory::Permanent,

            // Cancellation is terminal by definition
            Self::Cancelled(_) | Self::Closed => ErrorCategory::Permanent,

            // Processing errors need inspection
            Self::Processing(s) | Self::Internal(s) => {
                let lower = s.to_lowercase();
                if lower.contains("rate")
                    || lower.contains("limit")
                    || lower.contains("quota")
                    || lower.contains("throttl")
                    || lower.contains("429")
                    || lower.contains("too many")
                {
                    ErrorCategory::RateLimited
                } else if lower.contains("invalid")
                    || lower.contains("malformed")
                    || lower.contains("not found")
                    || lower.contains("forbidden")
                    || lower.contains("unauthorized")
                    || lower.contains("401")
                    || lower.contains("403")
                    || lower.contains("404")
                {
                    ErrorCategory::Permanent
                } else {
                    ErrorCategory::Transient
                }
            }
        }
    }
}

/// Error category for retry decisions.
///
/// - `Transient`: likely to resolve with retry (connection issues, timeouts)
/// - `Permanent`: will not be fixed by retrying (bad data, configuration)
/// - `RateLimited`: downstream is overloaded, needs longer backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary error - retry with backoff.
    Transient,

    /// Permanent error - do not retry.
    Permanent,

    /// Rate limited - retry with longer backoff.
    RateLimited,
}

impl ErrorCategory {
    /// Check if this error category should be retried.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::Processing("failed to deliver".to_string());
        assert_eq!(err.to_string(), "Processing error: failed to deliver");

        let err = QueueError::JobExists("job-1".to_string());
        assert_eq!(err.to_string(), "Job already exists: job-1");
    }

    #[test]
    fn test_is_connection_error() {
        assert!(QueueError::Connection("refused".to_string()).is_connection_error());
        assert!(!QueueError::Processing("invalid data".to_string()).is_connection_error());
    }

    #[test]
    fn test_category_transient() {
        let err = QueueError::Timeout("operation timed out".to_string());
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err = QueueError::Processing("503 service unavailable".to_string());
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_category_permanent() {
        let err = QueueError::InvalidInterval("banana".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);

        let err = QueueError::Processing("404 not found".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);

        let err = QueueError::Config("missing host".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_category_rate_limited() {
        let err = QueueError::Processing("429 too many requests".to_string());
        assert_eq!(err.category(), ErrorCategory::RateLimited);

        let err = QueueError::Processing("quota exceeded".to_string());
        assert_eq!(err.category(), ErrorCategory::RateLimited);
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        let err = QueueError::Cancelled("batch-7".to_string());
        assert!(err.is_cancelled());
        assert!(!err.category().should_retry());
    }

    #[test]
    fn test_should_retry() {
        assert!(ErrorCategory::Transient.should_retry());
        assert!(!ErrorCategory::Permanent.should_retry());
        assert!(ErrorCategory::RateLimited.should_retry());
    }
}

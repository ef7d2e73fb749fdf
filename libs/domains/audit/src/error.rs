//! Error types for the audit pipeline.

use thiserror::Error;

/// Errors from audit sinks.
#[derive(Error, Debug)]
pub enum AuditError {
    /// AMQP connection or protocol error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection could not be established in time.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The record was rejected by the sink.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Both the primary and the fallback sink failed.
    #[error("Primary failed ({primary}); fallback failed ({fallback})")]
    FallbackExhausted { primary: String, fallback: String },
}

/// Result type alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_exhausted_display() {
        let err = AuditError::FallbackExhausted {
            primary: "broker down".to_string(),
            fallback: "disk full".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("broker down"));
        assert!(text.contains("disk full"));
    }
}

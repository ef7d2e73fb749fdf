//! Error types for the notifications domain.

use thiserror::Error;

/// Errors from batch processing and its collaborators.
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Queue runtime error.
    #[error("Queue error: {0}")]
    Queue(#[from] job_queue::QueueError),

    /// Repository collaborator failure.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Delivery collaborator failure.
    #[error("Send error: {0}")]
    Send(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Batch payload failed validation.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Notification does not exist.
    #[error("Notification not found: {0}")]
    NotFound(uuid::Uuid),

    /// Batch does not exist.
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// The batch is already terminal; cancel was rejected.
    #[error("Batch not cancellable: {0}")]
    NotCancellable(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

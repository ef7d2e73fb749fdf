//! Notifications domain: batch processing over the job queue runtime.
//!
//! The [`BatchWorker`] owns a dedicated queue instance and drains queued
//! notifications in bulk, per-user, scheduled and priority batches with
//! per-channel pacing, cooperative cancellation, and quiet-hours handling.
//! Persistence and delivery are collaborator ports
//! ([`NotificationRepository`], [`NotificationSender`]) injected by the
//! embedding application.

pub mod batch;
pub mod error;
pub mod models;
pub mod repository;

pub use batch::{
    BatchEvent, BatchOutcome, BatchWorker, BatchWorkerConfig, CancelOutcome,
};
pub use error::{NotificationError, NotificationResult};
pub use models::{
    BatchJob, BatchOptions, BatchProgress, BatchRecord, BatchStatus, BatchType, Notification,
    NotificationChannel, NotificationPriority, NotificationStatus, QuietHours, UserPreferences,
};
pub use repository::{
    Clock, InMemoryRepository, NotificationRepository, NotificationSender, SystemClock,
};

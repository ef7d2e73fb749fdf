//! Job Queue - Broker-Agnostic Job Queue Runtime
//!
//! A reusable library for deferred and scheduled work with:
//! - A uniform queue contract over interchangeable backends
//! - Redis work-queue backend (priority buckets, delayed set, stalled
//!   recovery, retention)
//! - AMQP broker backend (exchange + dead-letter topology, prefetch,
//!   ack/nack, timer-held delays, reconnection)
//! - Fixed/linear/exponential retry backoff with jitter
//! - Typed lifecycle events over broadcast channels
//! - A factory registry keyed by `(broker, name)`
//! - Monitoring, Prometheus metrics, and an Axum admin surface
//!
//! # Architecture
//!
//! ```text
//! producers ── Queue::add ──> WorkQueue (Redis)  ─┐
//!                         └─> BrokerQueue (AMQP) ─┤ dispatch
//!                                                 v
//!                              Processor (per queue + name)
//!                                                 │ on exhausted retries
//!                                                 v
//!                              failed set / dead-letter exchange
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use job_queue::{FnProcessor, JobOptions, QueueConfig, QueueFactory};
//!
//! let factory = QueueFactory::global();
//! let queue = factory.create(QueueConfig::from_env("notifications")?).await?;
//!
//! queue
//!     .process(
//!         "send",
//!         4,
//!         FnProcessor::new(|job| async move {
//!             deliver(&job.data).await?;
//!             Ok(serde_json::json!("sent"))
//!         }),
//!     )
//!     .await?;
//!
//! let job = queue
//!     .add("send", payload, JobOptions::new().with_attempts(3))
//!     .await?;
//! ```

pub mod admin;
mod backoff;
mod broker;
mod config;
mod error;
mod events;
mod factory;
mod job;
pub mod metrics;
mod monitor;
mod queue;
mod work_queue;

// Re-export all public types
pub use admin::admin_router;
pub use backoff::{
    Backoff, BackoffKind, DEFAULT_MAX_DELAY_MS, compute_backoff, format_interval, parse_interval,
};
pub use broker::BrokerQueue;
pub use config::{
    AmqpSettings, BrokerKind, DefaultJobOptions, ExchangeType, MonitoringSettings, QueueConfig,
    RedisSettings,
};
pub use error::{ErrorCategory, QueueError};
pub use events::{EventBus, QueueEvent};
pub use factory::QueueFactory;
pub use job::{
    Job, JobMessage, JobOptions, JobProgress, JobState, PRIORITY_LEVELS, Repeat, Retention,
};
pub use metrics::{MetricsTimer, QueueMetricsSnapshot, ThroughputTracker, init_metrics};
pub use monitor::{DashboardSummary, HealthStatus, QueueMonitor, RetryError, RetryReport};
pub use queue::{FnProcessor, JobCounts, NewJob, Processor, Queue};
pub use work_queue::WorkQueue;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

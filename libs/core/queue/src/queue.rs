//! The uniform queue contract.
//!
//! This module provides:
//! - `Processor` trait for job handlers
//! - `Queue` trait implemented by both backends
//! - `JobCounts` per-state snapshot

use crate::config::BrokerKind;
use crate::error::QueueError;
use crate::events::QueueEvent;
use crate::job::{Job, JobOptions, JobProgress, JobState};
use crate::metrics::QueueMetricsSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A job handler registered under a `(queue, name)` pair.
///
/// The returned value becomes the job's `return_value`; an error feeds the
/// retry/backoff state machine.
///
/// # Example
///
/// ```rust,ignore
/// struct SendProcessor;
///
/// #[async_trait]
/// impl Processor for SendProcessor {
///     async fn process(&self, job: Job) -> Result<serde_json::Value, QueueError> {
///         deliver(&job.data).await?;
///         Ok(serde_json::json!("ok"))
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: Job) -> Result<serde_json::Value, QueueError>;
}

type ProcessorFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, QueueError>> + Send>>;

/// Adapter turning a closure into a [`Processor`].
pub struct FnProcessor {
    f: Box<dyn Fn(Job) -> ProcessorFuture + Send + Sync>,
}

impl FnProcessor {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, QueueError>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |job| Box::pin(f(job))),
        })
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, job: Job) -> Result<serde_json::Value, QueueError> {
        (self.f)(job).await
    }
}

/// Input entry for [`Queue::add_bulk`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> Self {
        Self {
            name: name.into(),
            data,
            opts,
        }
    }
}

/// Per-state job counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub stuck: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed + self.stuck
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting | JobState::Paused => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Stuck => self.stuck,
        }
    }
}

/// Uniform operations over a named job queue, independent of the backend.
///
/// Guarantees:
/// - `add` returns a job observable via `get_job` immediately.
/// - `add_bulk` is best-effort per entry; the result has one slot per input.
/// - `process` registers exactly one processor per name; duplicates error.
/// - `pause` stops dispatch but keeps accepting jobs; active jobs finish.
/// - `clean` removes terminal jobs older than the grace period, oldest first.
/// - `empty` discards queued jobs and cancels timers without touching
///   in-flight work.
/// - `close` drains in-flight work where possible, then releases resources.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Backend this queue runs on.
    fn broker(&self) -> BrokerKind;

    /// Add a single job.
    async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError>;

    /// Add a batch of jobs; per-entry results, same order and length.
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Vec<Result<Job, QueueError>>;

    /// Register a processor for `name` with `concurrency` parallel workers.
    async fn process(
        &self,
        name: &str,
        concurrency: usize,
        processor: Arc<dyn Processor>,
    ) -> Result<(), QueueError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// List jobs in the given states, sliced by `[start, end)` after
    /// collection. There is no transactional read across calls.
    async fn get_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError>;

    async fn get_job_counts(&self) -> Result<JobCounts, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    fn is_paused(&self) -> bool;

    /// Remove terminal jobs older than `grace_ms`, oldest first, up to
    /// `limit`. Returns removed job ids.
    async fn clean(
        &self,
        grace_ms: u64,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, QueueError>;

    /// Discard all queued jobs and cancel scheduled timers.
    async fn empty(&self) -> Result<(), QueueError>;

    /// Drain in-flight work, then release resources.
    async fn close(&self) -> Result<(), QueueError>;

    /// Current metrics snapshot.
    async fn metrics(&self) -> Result<QueueMetricsSnapshot, QueueError>;

    /// Subscribe to this queue's events.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    // Job handle operations

    /// Replace a job's payload.
    async fn update_job(&self, id: &str, data: serde_json::Value) -> Result<(), QueueError>;

    /// Report progress; emits `job:progress` at least once.
    async fn job_progress(&self, id: &str, progress: JobProgress) -> Result<(), QueueError>;

    /// Append a log line to the job.
    async fn job_log(&self, id: &str, message: &str) -> Result<(), QueueError>;

    /// Remove a job from the queue. Idempotent.
    async fn remove_job(&self, id: &str) -> Result<(), QueueError>;

    /// Return a failed job to the waiting state.
    async fn retry_job(&self, id: &str) -> Result<(), QueueError>;

    /// Suppress any further retries for the job.
    async fn discard_job(&self, id: &str) -> Result<(), QueueError>;

    /// Move a delayed job to waiting immediately.
    async fn promote_job(&self, id: &str) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_processor_adapts_closures() {
        let processor = FnProcessor::new(|job: Job| async move {
            Ok(json!({ "echo": job.data }))
        });

        let job = Job::new("echo", json!(42), JobOptions::default());
        let out = processor.process(job).await.unwrap();
        assert_eq!(out, json!({ "echo": 42 }));
    }

    #[test]
    fn test_job_counts_total_and_get() {
        let counts = JobCounts {
            waiting: 3,
            delayed: 1,
            active: 2,
            completed: 10,
            failed: 4,
            stuck: 0,
        };

        assert_eq!(counts.total(), 20);
        assert_eq!(counts.get(JobState::Waiting), 3);
        assert_eq!(counts.get(JobState::Failed), 4);
        assert_eq!(counts.get(JobState::Stuck), 0);
    }
}

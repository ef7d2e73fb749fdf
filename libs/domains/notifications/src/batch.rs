//! Batch worker: bulk, per-user, scheduled and priority notification
//! pipelines over a dedicated queue instance.
//!
//! The worker registers one processor per batch type plus a retry path and
//! a repeating auto-collection job. Batches are processed in chunks of
//! `max_concurrency` parallel sends with per-channel pacing; cancellation
//! is cooperative through a per-batch flag checked before every chunk and
//! every item.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    BatchJob, BatchOptions, BatchProgress, BatchRecord, BatchStatus, BatchType,
    NotificationChannel, NotificationPriority, NotificationStatus,
};
use crate::repository::{Clock, NotificationRepository, NotificationSender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_config::env_parse_or;
use job_queue::{Job, JobOptions, Processor, Queue, QueueError, Repeat};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metric names as constants for consistency
pub mod names {
    pub const BATCH_PROCESSING: &str = "batch_processing_total";
    pub const NOTIFICATIONS_PROCESSED: &str = "batch_notifications_processed";
    pub const NOTIFICATIONS_FAILED: &str = "batch_notifications_failed";
}

/// Job id of the repeating auto-collection job.
const AUTO_COLLECT_JOB_ID: &str = "auto-collect-batches";

/// Queue processor name for single-notification retries.
const RETRY_PROCESSOR: &str = "retry-notification";

/// Configuration for the batch worker.
#[derive(Debug, Clone)]
pub struct BatchWorkerConfig {
    /// Target notifications per bulk batch.
    pub batch_size: usize,
    /// Queue-level worker concurrency per processor.
    pub concurrency: usize,
    /// Interval between auto-collection ticks in milliseconds.
    pub auto_collect_interval_ms: u64,
    /// Delay before a failed item is retried, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for BatchWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 4,
            auto_collect_interval_ms: 30_000,
            retry_delay_ms: 5_000,
        }
    }
}

impl BatchWorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse_or("BATCH_SIZE", defaults.batch_size).max(1),
            concurrency: env_parse_or("BATCH_WORKER_CONCURRENCY", defaults.concurrency).max(1),
            auto_collect_interval_ms: env_parse_or(
                "BATCH_AUTO_COLLECT_INTERVAL",
                defaults.auto_collect_interval_ms,
            ),
            retry_delay_ms: env_parse_or("BATCH_RETRY_DELAY", defaults.retry_delay_ms),
        }
    }
}

/// Events emitted by the batch worker.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    StatusChanged {
        batch_id: String,
        status: BatchStatus,
        progress: BatchProgress,
    },
}

impl BatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "batch_status_changed",
        }
    }
}

/// Result of processing (or rescheduling) one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    pub processed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Set when a user batch was pushed past a quiet-hours window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescheduled_ms: Option<u64>,
}

/// How a cancellation request was honored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The batch was still queued; it was removed outright.
    Removed,
    /// The batch is mid-flight; its flag is set and workers will stop at
    /// the next checkpoint.
    Flagged,
}

/// Bookkeeping for a batch currently being processed.
struct ActiveBatch {
    started_at: DateTime<Utc>,
    remaining: HashSet<Uuid>,
}

enum ItemOutcome {
    Processed(Uuid),
    Failed(Uuid),
    Cancelled(Uuid),
}

struct BatchWorkerInner {
    queue: Arc<dyn Queue>,
    repository: Arc<dyn NotificationRepository>,
    sender: Arc<dyn NotificationSender>,
    clock: Arc<dyn Clock>,
    config: BatchWorkerConfig,
    /// Remaining-item bookkeeping per in-flight batch.
    active: std::sync::Mutex<HashMap<String, ActiveBatch>>,
    /// Cooperative cancellation flags; created by whichever side gets there
    /// first so a cancel just before processing still lands.
    cancel_flags: std::sync::Mutex<HashMap<String, Arc<AtomicBool>>>,
    events: broadcast::Sender<BatchEvent>,
}

/// Batch worker over a dedicated queue instance.
pub struct BatchWorker {
    inner: Arc<BatchWorkerInner>,
}

impl BatchWorker {
    pub fn new(
        queue: Arc<dyn Queue>,
        repository: Arc<dyn NotificationRepository>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
        config: BatchWorkerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BatchWorkerInner {
                queue,
                repository,
                sender,
                clock,
                config,
                active: std::sync::Mutex::new(HashMap::new()),
                cancel_flags: std::sync::Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Register every processor and the repeating auto-collection job.
    pub async fn start(&self) -> NotificationResult<()> {
        let c = self.inner.config.concurrency;

        for batch_type in [
            BatchType::BulkNotification,
            BatchType::UserBatch,
            BatchType::ScheduledBatch,
            BatchType::PriorityBatch,
        ] {
            self.inner
                .queue
                .process(
                    batch_type.processor_name(),
                    c,
                    Arc::new(BatchProcessor {
                        inner: Arc::clone(&self.inner),
                        batch_type,
                    }),
                )
                .await?;
        }

        self.inner
            .queue
            .process(
                RETRY_PROCESSOR,
                c,
                Arc::new(RetryProcessor {
                    inner: Arc::clone(&self.inner),
                }),
            )
            .await?;

        self.inner
            .queue
            .process(
                AUTO_COLLECT_JOB_ID,
                1,
                Arc::new(AutoCollectProcessor {
                    inner: Arc::clone(&self.inner),
                }),
            )
            .await?;

        let repeat = Repeat::every(self.inner.config.auto_collect_interval_ms).immediately();
        let result = self
            .inner
            .queue
            .add(
                AUTO_COLLECT_JOB_ID,
                serde_json::Value::Null,
                JobOptions::new()
                    .with_job_id(AUTO_COLLECT_JOB_ID)
                    .with_repeat(repeat),
            )
            .await;
        match result {
            Ok(_) => {}
            // A previous run already installed the schedule
            Err(QueueError::JobExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            batch_size = self.inner.config.batch_size,
            concurrency = c,
            interval_ms = self.inner.config.auto_collect_interval_ms,
            "Batch worker started"
        );
        Ok(())
    }

    /// Subscribe to batch status events.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    /// Ids of batches currently mid-flight.
    pub fn active_batches(&self) -> Vec<String> {
        self.inner.active.lock().unwrap().keys().cloned().collect()
    }

    /// Create the repository record and enqueue a batch job.
    pub async fn enqueue_batch(&self, batch: BatchJob) -> NotificationResult<Job> {
        self.inner.enqueue_batch(batch, 0).await
    }

    /// Enqueue a batch to run at a future time.
    pub async fn schedule_batch(
        &self,
        mut batch: BatchJob,
        run_at: DateTime<Utc>,
    ) -> NotificationResult<Job> {
        batch.batch_type = BatchType::ScheduledBatch;
        let delay = (run_at - self.inner.clock.now()).num_milliseconds().max(0) as u64;
        self.inner.enqueue_batch(batch, delay).await
    }

    /// Run one auto-collection pass. Normally driven by the repeating job.
    pub async fn auto_collect(&self) -> NotificationResult<usize> {
        self.inner.auto_collect().await
    }

    /// Process a batch inline. Normally driven by the queue processors.
    pub async fn process_batch(
        &self,
        batch_type: BatchType,
        batch: BatchJob,
    ) -> NotificationResult<BatchOutcome> {
        self.inner.process_batch(batch_type, batch).await
    }

    /// Cancel a batch.
    ///
    /// - Waiting/Delayed: removed from the queue, notifications marked
    ///   cancelled.
    /// - Active: the cancellation flag is set; workers stop at the next
    ///   chunk/item boundary and discard the remainder.
    /// - Completed/Failed: rejected.
    pub async fn cancel_batch(&self, batch_id: &str) -> NotificationResult<CancelOutcome> {
        let inner = &self.inner;

        // Mid-flight batch: flip the flag and let the processor wind down
        if inner.active.lock().unwrap().contains_key(batch_id) {
            inner.cancel_flag(batch_id).store(true, Ordering::SeqCst);
            info!(batch_id, "Cancellation flagged for active batch");
            return Ok(CancelOutcome::Flagged);
        }

        let job = inner
            .queue
            .get_job(batch_id)
            .await?
            .ok_or_else(|| NotificationError::BatchNotFound(batch_id.to_string()))?;

        match job.state {
            job_queue::JobState::Waiting
            | job_queue::JobState::Delayed
            | job_queue::JobState::Paused => {
                inner.queue.remove_job(batch_id).await?;

                let batch: BatchJob = serde_json::from_value(job.data)?;
                for id in &batch.notification_ids {
                    inner
                        .repository
                        .update_status(*id, NotificationStatus::Cancelled)
                        .await?;
                }

                let progress = BatchProgress {
                    cancelled: batch.notification_ids.len(),
                    ..Default::default()
                };
                inner
                    .repository
                    .update_batch_status(batch_id, BatchStatus::Cancelled, progress)
                    .await?;
                inner.emit(batch_id, BatchStatus::Cancelled, progress);

                info!(batch_id, "Cancelled queued batch");
                Ok(CancelOutcome::Removed)
            }
            job_queue::JobState::Active | job_queue::JobState::Stuck => {
                // Raced the dispatcher: flag it anyway
                inner.cancel_flag(batch_id).store(true, Ordering::SeqCst);
                Ok(CancelOutcome::Flagged)
            }
            job_queue::JobState::Completed | job_queue::JobState::Failed => Err(
                NotificationError::NotCancellable(batch_id.to_string()),
            ),
        }
    }
}

impl BatchWorkerInner {
    fn emit(&self, batch_id: &str, status: BatchStatus, progress: BatchProgress) {
        let _ = self.events.send(BatchEvent::StatusChanged {
            batch_id: batch_id.to_string(),
            status,
            progress,
        });
    }

    /// Get or create the cancellation flag for a batch.
    fn cancel_flag(&self, batch_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().unwrap();
        Arc::clone(
            flags
                .entry(batch_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    fn queue_priority(priority: NotificationPriority) -> u8 {
        match priority {
            NotificationPriority::Critical => 0,
            NotificationPriority::Urgent => 1,
            NotificationPriority::High => 2,
            NotificationPriority::Normal => 5,
            NotificationPriority::Low => 8,
        }
    }

    async fn enqueue_batch(&self, batch: BatchJob, delay_ms: u64) -> NotificationResult<Job> {
        self.repository
            .create_batch_record(BatchRecord::new(&batch))
            .await?;

        let opts = JobOptions::new()
            .with_job_id(batch.id.clone())
            .with_priority(Self::queue_priority(batch.priority))
            .with_delay(delay_ms);

        let job = self
            .queue
            .add(
                batch.batch_type.processor_name(),
                serde_json::to_value(&batch)?,
                opts,
            )
            .await?;

        debug!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            items = batch.notification_ids.len(),
            delay_ms,
            "Enqueued batch"
        );
        Ok(job)
    }

    /// One auto-collection tick; returns the number of batches enqueued.
    async fn auto_collect(&self) -> NotificationResult<usize> {
        let batch_size = self.config.batch_size;

        // Normal and low priority feed the channel-grouped bulk pipeline
        let normal = self
            .repository
            .get_queued_notifications(&[NotificationPriority::Normal], batch_size * 2)
            .await?;
        let low = self
            .repository
            .get_queued_notifications(&[NotificationPriority::Low], batch_size * 3)
            .await?;

        let mut by_channel: HashMap<NotificationChannel, Vec<Uuid>> = HashMap::new();
        for notification in normal.into_iter().chain(low) {
            by_channel
                .entry(notification.channel)
                .or_default()
                .push(notification.id);
        }

        let mut enqueued = 0;
        for (channel, ids) in by_channel {
            for chunk in ids.chunks(batch_size) {
                let batch = BatchJob::new(
                    BatchType::BulkNotification,
                    chunk.to_vec(),
                    Some(channel),
                    NotificationPriority::Normal,
                    BatchOptions::for_channel(channel),
                );
                self.enqueue_batch(batch, 0).await?;
                enqueued += 1;
            }
        }

        // Elevated priorities jump the line in a single high-concurrency batch
        let elevated = self
            .repository
            .get_queued_notifications(&NotificationPriority::ELEVATED, batch_size * 2)
            .await?;
        if !elevated.is_empty() {
            let options = BatchOptions {
                delay_between_items_ms: 50,
                max_concurrency: self.config.concurrency * 2,
                retry_failed_items: true,
            };
            let ids = elevated.iter().map(|n| n.id).collect();
            let batch = BatchJob::new(
                BatchType::PriorityBatch,
                ids,
                None,
                NotificationPriority::Critical,
                options,
            );
            self.enqueue_batch(batch, 0).await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(batches = enqueued, "Auto-collection enqueued batches");
        }
        Ok(enqueued)
    }

    async fn process_batch(
        &self,
        batch_type: BatchType,
        batch: BatchJob,
    ) -> NotificationResult<BatchOutcome> {
        // User batches respect the recipient's quiet hours
        if batch_type == BatchType::UserBatch {
            if let Some(delay_ms) = self.quiet_hours_delay(&batch).await? {
                self.queue
                    .add(
                        BatchType::UserBatch.processor_name(),
                        serde_json::to_value(&batch)?,
                        JobOptions::new()
                            .with_priority(Self::queue_priority(batch.priority))
                            .with_delay(delay_ms),
                    )
                    .await?;

                info!(batch_id = %batch.id, delay_ms, "User batch rescheduled past quiet hours");
                return Ok(BatchOutcome {
                    batch_id: batch.id,
                    status: BatchStatus::Pending,
                    processed: 0,
                    failed: 0,
                    cancelled: 0,
                    rescheduled_ms: Some(delay_ms),
                });
            }
        }

        let channel_label = batch
            .channel
            .map(|c| c.as_str())
            .unwrap_or("mixed");
        counter!(
            names::BATCH_PROCESSING,
            "type" => batch.batch_type.processor_name(),
            "channel" => channel_label
        )
        .increment(1);

        let cancel = self.cancel_flag(&batch.id);
        self.active.lock().unwrap().insert(
            batch.id.clone(),
            ActiveBatch {
                started_at: self.clock.now(),
                remaining: batch.notification_ids.iter().copied().collect(),
            },
        );
        self.repository
            .update_batch_status(&batch.id, BatchStatus::Processing, BatchProgress::default())
            .await?;

        let outcome = self.run_chunks(batch_type, &batch, &cancel).await;

        // Bookkeeping teardown happens regardless of the outcome
        let started_at = self
            .active
            .lock()
            .unwrap()
            .remove(&batch.id)
            .map(|a| a.started_at);
        self.cancel_flags.lock().unwrap().remove(&batch.id);

        if let Some(started_at) = started_at {
            let elapsed_ms = (self.clock.now() - started_at).num_milliseconds();
            debug!(batch_id = %batch.id, elapsed_ms, "Batch teardown");
        }

        outcome
    }

    async fn run_chunks(
        &self,
        batch_type: BatchType,
        batch: &BatchJob,
        cancel: &Arc<AtomicBool>,
    ) -> NotificationResult<BatchOutcome> {
        let options = batch.processing_options;
        let concurrency = options.max_concurrency.max(1);
        let is_priority = batch_type == BatchType::PriorityBatch;

        let mut processed = 0usize;
        let mut failed_ids: Vec<Uuid> = Vec::new();
        let mut was_cancelled = false;

        'chunks: for chunk in batch.notification_ids.chunks(concurrency) {
            if cancel.load(Ordering::SeqCst) {
                was_cancelled = true;
                break 'chunks;
            }

            let mut join_set: JoinSet<ItemOutcome> = JoinSet::new();
            for &id in chunk {
                let repository = Arc::clone(&self.repository);
                let sender = Arc::clone(&self.sender);
                let cancel = Arc::clone(cancel);
                let delay_ms = options.delay_between_items_ms;

                join_set.spawn(async move {
                    if cancel.load(Ordering::SeqCst) {
                        return ItemOutcome::Cancelled(id);
                    }

                    let mut result =
                        Self::process_notification(&repository, &sender, id).await;
                    if result.is_err() && is_priority {
                        // Priority batches get one immediate retry before
                        // the failure is recorded
                        result = Self::process_notification(&repository, &sender, id).await;
                    }

                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }

                    match result {
                        Ok(()) => ItemOutcome::Processed(id),
                        Err(_) => ItemOutcome::Failed(id),
                    }
                });
            }

            let mut chunk_cancelled = false;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(ItemOutcome::Processed(id)) => {
                        processed += 1;
                        self.forget_remaining(&batch.id, id);
                    }
                    Ok(ItemOutcome::Failed(id)) => {
                        failed_ids.push(id);
                        self.forget_remaining(&batch.id, id);
                    }
                    Ok(ItemOutcome::Cancelled(_)) => {
                        chunk_cancelled = true;
                    }
                    Err(e) => {
                        warn!(batch_id = %batch.id, error = %e, "Batch item task failed");
                    }
                }
            }

            if chunk_cancelled || cancel.load(Ordering::SeqCst) {
                was_cancelled = true;
                break 'chunks;
            }
        }

        let mut cancelled_count = 0usize;
        if was_cancelled {
            // Whatever was not settled is discarded and marked cancelled
            let remaining: Vec<Uuid> = {
                let active = self.active.lock().unwrap();
                active
                    .get(&batch.id)
                    .map(|a| a.remaining.iter().copied().collect())
                    .unwrap_or_default()
            };
            cancelled_count = remaining.len();
            for id in remaining {
                self.repository
                    .update_status(id, NotificationStatus::Cancelled)
                    .await?;
            }
        } else if options.retry_failed_items && !failed_ids.is_empty() {
            for id in &failed_ids {
                let result = self
                    .queue
                    .add(
                        RETRY_PROCESSOR,
                        serde_json::json!({ "notificationId": id }),
                        JobOptions::new().with_delay(self.config.retry_delay_ms),
                    )
                    .await;
                if let Err(e) = result {
                    warn!(notification_id = %id, error = %e, "Failed to enqueue retry");
                }
            }
        }

        counter!(names::NOTIFICATIONS_PROCESSED).increment(processed as u64);
        counter!(names::NOTIFICATIONS_FAILED).increment(failed_ids.len() as u64);

        let status = if was_cancelled || !failed_ids.is_empty() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        let progress = BatchProgress {
            processed,
            failed: failed_ids.len(),
            cancelled: cancelled_count,
            partially_processed: was_cancelled,
        };

        self.repository
            .update_batch_status(&batch.id, status, progress)
            .await?;
        self.emit(&batch.id, status, progress);

        info!(
            batch_id = %batch.id,
            batch_type = %batch_type,
            processed,
            failed = failed_ids.len(),
            cancelled = cancelled_count,
            status = %status,
            "Batch finished"
        );

        Ok(BatchOutcome {
            batch_id: batch.id.clone(),
            status,
            processed,
            failed: failed_ids.len(),
            cancelled: cancelled_count,
            rescheduled_ms: None,
        })
    }

    fn forget_remaining(&self, batch_id: &str, id: Uuid) {
        let mut active = self.active.lock().unwrap();
        if let Some(batch) = active.get_mut(batch_id) {
            batch.remaining.remove(&id);
        }
    }

    /// Milliseconds until the recipient's quiet window ends, if the batch
    /// would land inside one.
    async fn quiet_hours_delay(&self, batch: &BatchJob) -> NotificationResult<Option<u64>> {
        let Some(user_id) = batch.user_id() else {
            return Ok(None);
        };

        let preferences = self.repository.get_user_preferences(user_id).await?;
        let Some(quiet) = preferences.quiet_hours else {
            return Ok(None);
        };

        let now = self.clock.now().time();
        let delay = quiet.ms_until_end(now);
        Ok((delay > 0).then_some(delay))
    }

    /// Drive one notification through the repository and sender.
    async fn process_notification(
        repository: &Arc<dyn NotificationRepository>,
        sender: &Arc<dyn NotificationSender>,
        id: Uuid,
    ) -> NotificationResult<()> {
        let notification = repository
            .find_by_id(id)
            .await?
            .ok_or(NotificationError::NotFound(id))?;

        repository
            .update_status(id, NotificationStatus::Processing)
            .await?;

        match sender.send(&notification).await {
            Ok(()) => {
                repository.update_status(id, NotificationStatus::Sent).await?;
                Ok(())
            }
            Err(e) => {
                repository
                    .update_status(id, NotificationStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Queue processors
// ============================================================================

fn to_queue_error(err: NotificationError) -> QueueError {
    match err {
        NotificationError::Queue(e) => e,
        other => QueueError::Processing(other.to_string()),
    }
}

struct BatchProcessor {
    inner: Arc<BatchWorkerInner>,
    batch_type: BatchType,
}

#[async_trait]
impl Processor for BatchProcessor {
    async fn process(&self, job: Job) -> Result<serde_json::Value, QueueError> {
        let batch: BatchJob = serde_json::from_value(job.data)
            .map_err(|e| QueueError::Processing(format!("invalid batch payload: {}", e)))?;

        let outcome = self
            .inner
            .process_batch(self.batch_type, batch)
            .await
            .map_err(to_queue_error)?;
        Ok(serde_json::to_value(outcome)?)
    }
}

struct RetryProcessor {
    inner: Arc<BatchWorkerInner>,
}

#[async_trait]
impl Processor for RetryProcessor {
    async fn process(&self, job: Job) -> Result<serde_json::Value, QueueError> {
        let id: Uuid = job
            .data
            .get("notificationId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                QueueError::Processing("retry payload missing notificationId".to_string())
            })?;

        BatchWorkerInner::process_notification(
            &self.inner.repository,
            &self.inner.sender,
            id,
        )
        .await
        .map_err(to_queue_error)?;
        Ok(serde_json::json!({ "retried": id }))
    }
}

struct AutoCollectProcessor {
    inner: Arc<BatchWorkerInner>,
}

#[async_trait]
impl Processor for AutoCollectProcessor {
    async fn process(&self, _job: Job) -> Result<serde_json::Value, QueueError> {
        let enqueued = self.inner.auto_collect().await.map_err(to_queue_error)?;
        Ok(serde_json::json!({ "enqueued": enqueued }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Notification;
    use crate::repository::{InMemoryRepository, MockNotificationSender, SystemClock};
    use chrono::{NaiveTime, TimeZone};
    use job_queue::{
        BrokerKind, EventBus, JobCounts, JobProgress, JobState, NewJob,
        QueueEvent, QueueMetricsSnapshot, ThroughputTracker,
    };
    use serde_json::json;
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    /// Minimal in-memory queue recording adds; enough surface for the
    /// worker paths under test.
    #[derive(Default)]
    struct TestQueue {
        added: Mutex<Vec<(String, serde_json::Value, JobOptions)>>,
        jobs: Mutex<HashMap<String, Job>>,
        events: EventBus,
    }

    impl TestQueue {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
                jobs: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            })
        }

        fn added_named(&self, name: &str) -> Vec<(serde_json::Value, JobOptions)> {
            self.added
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _, _)| n == name)
                .map(|(_, data, opts)| (data.clone(), opts.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl Queue for TestQueue {
        fn name(&self) -> &str {
            "test"
        }

        fn broker(&self) -> BrokerKind {
            BrokerKind::Redis
        }

        async fn add(
            &self,
            name: &str,
            data: serde_json::Value,
            opts: JobOptions,
        ) -> Result<Job, QueueError> {
            let job = Job::new(name, data.clone(), opts.clone());
            self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
            self.added
                .lock()
                .unwrap()
                .push((name.to_string(), data, opts));
            Ok(job)
        }

        async fn add_bulk(&self, jobs: Vec<NewJob>) -> Vec<Result<Job, QueueError>> {
            let mut out = Vec::new();
            for j in jobs {
                out.push(self.add(&j.name, j.data, j.opts).await);
            }
            out
        }

        async fn process(
            &self,
            _name: &str,
            _concurrency: usize,
            _processor: Arc<dyn Processor>,
        ) -> Result<(), QueueError> {
            Ok(())
        }

        async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn get_jobs(
            &self,
            _states: &[JobState],
            _start: usize,
            _end: usize,
        ) -> Result<Vec<Job>, QueueError> {
            Ok(Vec::new())
        }

        async fn get_job_counts(&self) -> Result<JobCounts, QueueError> {
            Ok(JobCounts::default())
        }

        async fn pause(&self) -> Result<(), QueueError> {
            Ok(())
        }

        async fn resume(&self) -> Result<(), QueueError> {
            Ok(())
        }

        fn is_paused(&self) -> bool {
            false
        }

        async fn clean(
            &self,
            _grace_ms: u64,
            _state: Option<JobState>,
            _limit: Option<usize>,
        ) -> Result<Vec<String>, QueueError> {
            Ok(Vec::new())
        }

        async fn empty(&self) -> Result<(), QueueError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }

        async fn metrics(&self) -> Result<QueueMetricsSnapshot, QueueError> {
            let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
            Ok(tracker.snapshot("test", BrokerKind::Redis, JobCounts::default(), false))
        }

        fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
            self.events.subscribe()
        }

        async fn update_job(
            &self,
            _id: &str,
            _data: serde_json::Value,
        ) -> Result<(), QueueError> {
            Ok(())
        }

        async fn job_progress(&self, _id: &str, _progress: JobProgress) -> Result<(), QueueError> {
            Ok(())
        }

        async fn job_log(&self, _id: &str, _message: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn remove_job(&self, id: &str) -> Result<(), QueueError> {
            self.jobs.lock().unwrap().remove(id);
            Ok(())
        }

        async fn retry_job(&self, _id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn discard_job(&self, _id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn promote_job(&self, _id: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    /// Sender that succeeds or fails per a predicate and can trip a cancel
    /// flag after a fixed number of sends.
    struct ScriptedSender {
        sent: Mutex<Vec<Uuid>>,
        fail_ids: HashSet<Uuid>,
        cancel_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl ScriptedSender {
        fn ok() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_ids: HashSet::new(),
                cancel_after: None,
            }
        }

        fn failing(ids: impl IntoIterator<Item = Uuid>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_ids: ids.into_iter().collect(),
                cancel_after: None,
            }
        }

        fn cancelling_after(n: usize, flag: Arc<AtomicBool>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_ids: HashSet::new(),
                cancel_after: Some((n, flag)),
            }
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSender for ScriptedSender {
        async fn send(&self, notification: &Notification) -> NotificationResult<()> {
            if self.fail_ids.contains(&notification.id) {
                return Err(NotificationError::Send("provider rejected".to_string()));
            }

            let count = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(notification.id);
                sent.len()
            };
            if let Some((after, flag)) = &self.cancel_after {
                if count >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn seed_notifications(
        repo: &InMemoryRepository,
        n: usize,
        channel: NotificationChannel,
        priority: NotificationPriority,
    ) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                let notification = Notification::new(
                    Uuid::new_v4(),
                    channel,
                    priority,
                    format!("n{}", i),
                    json!({}),
                );
                let id = notification.id;
                repo.insert_notification(notification);
                id
            })
            .collect()
    }

    fn worker(
        queue: Arc<TestQueue>,
        repo: Arc<dyn NotificationRepository>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
    ) -> BatchWorker {
        BatchWorker::new(
            queue,
            repo,
            sender,
            clock,
            BatchWorkerConfig {
                batch_size: 10,
                concurrency: 2,
                auto_collect_interval_ms: 60_000,
                retry_delay_ms: 5_000,
            },
        )
    }

    fn bulk_batch(ids: Vec<Uuid>, channel: NotificationChannel) -> BatchJob {
        let mut options = BatchOptions::for_channel(channel);
        options.delay_between_items_ms = 0; // keep tests fast
        BatchJob::new(
            BatchType::BulkNotification,
            ids,
            Some(channel),
            NotificationPriority::Normal,
            options,
        )
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_bulk_batch_happy_path() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());
        let ids = seed_notifications(&repo, 5, NotificationChannel::Email, NotificationPriority::Normal);

        let worker = worker(queue.clone(), repo.clone(), sender.clone(), clock());
        let batch = bulk_batch(ids.clone(), NotificationChannel::Email);
        worker.enqueue_batch(batch.clone()).await.unwrap();

        let outcome = worker
            .process_batch(BatchType::BulkNotification, batch.clone())
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.processed, 5);
        assert_eq!(outcome.failed, 0);
        assert_eq!(sender.sent_count(), 5);

        for id in ids {
            assert_eq!(repo.notification_status(id), Some(NotificationStatus::Sent));
        }
        let record = repo.batch_record(&batch.id).unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert!(!record.partially_processed);
        assert!(worker.active_batches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_items_marked_and_retried() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let ids = seed_notifications(&repo, 4, NotificationChannel::Email, NotificationPriority::Normal);
        let sender = Arc::new(ScriptedSender::failing([ids[1], ids[3]]));

        let worker = worker(queue.clone(), repo.clone(), sender, clock());
        let batch = bulk_batch(ids.clone(), NotificationChannel::Email);
        worker.enqueue_batch(batch.clone()).await.unwrap();

        let outcome = worker
            .process_batch(BatchType::BulkNotification, batch.clone())
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Failed);
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed, 2);

        assert_eq!(repo.notification_status(ids[1]), Some(NotificationStatus::Failed));
        assert_eq!(repo.notification_status(ids[0]), Some(NotificationStatus::Sent));

        // Failed items re-enqueued through the retry path with the 5s delay
        let retries = queue.added_named(RETRY_PROCESSOR);
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|(_, opts)| opts.delay == 5_000));
    }

    #[tokio::test]
    async fn test_precancelled_batch_processes_nothing() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());
        let ids = seed_notifications(&repo, 6, NotificationChannel::Push, NotificationPriority::Normal);

        let worker = worker(queue.clone(), repo.clone(), sender.clone(), clock());
        let batch = bulk_batch(ids.clone(), NotificationChannel::Push);
        worker.enqueue_batch(batch.clone()).await.unwrap();

        // Flag before processing begins
        worker
            .inner
            .cancel_flag(&batch.id)
            .store(true, Ordering::SeqCst);

        let outcome = worker
            .process_batch(BatchType::BulkNotification, batch.clone())
            .await
            .unwrap();

        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.cancelled, 6);
        assert_eq!(sender.sent_count(), 0);
        for id in ids {
            assert_eq!(
                repo.notification_status(id),
                Some(NotificationStatus::Cancelled)
            );
        }
        let record = repo.batch_record(&batch.id).unwrap();
        assert_eq!(record.status, BatchStatus::Failed);
        assert!(record.partially_processed);
    }

    #[tokio::test]
    async fn test_mid_flight_cancellation_stops_at_boundary() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let ids = seed_notifications(&repo, 10, NotificationChannel::Email, NotificationPriority::Normal);

        let trip_flag = Arc::new(AtomicBool::new(false));
        let sender = Arc::new(ScriptedSender::cancelling_after(3, trip_flag.clone()));
        let worker = worker(queue.clone(), repo.clone(), sender, clock());

        let mut batch = bulk_batch(ids.clone(), NotificationChannel::Email);
        batch.processing_options.max_concurrency = 1; // serialize for determinism
        worker.enqueue_batch(batch.clone()).await.unwrap();

        // Wire the trip flag to the batch's cancellation flag
        {
            let real_flag = worker.inner.cancel_flag(&batch.id);
            let trip = trip_flag.clone();
            tokio::spawn(async move {
                loop {
                    if trip.load(Ordering::SeqCst) {
                        real_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
        }

        let outcome = worker
            .process_batch(BatchType::BulkNotification, batch.clone())
            .await
            .unwrap();

        // Three sends happened, the trip wire fired, and the rest were
        // discarded at a checkpoint
        assert!(outcome.processed >= 3);
        assert!(outcome.processed < 10);
        assert_eq!(outcome.processed + outcome.cancelled, 10);
        assert_eq!(outcome.status, BatchStatus::Failed);

        let record = repo.batch_record(&batch.id).unwrap();
        assert!(record.partially_processed);
        let cancelled = ids
            .iter()
            .filter(|id| repo.notification_status(**id) == Some(NotificationStatus::Cancelled))
            .count();
        assert_eq!(cancelled, outcome.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_queued_batch_removes_job() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());
        let ids = seed_notifications(&repo, 3, NotificationChannel::Sms, NotificationPriority::Normal);

        let worker = worker(queue.clone(), repo.clone(), sender, clock());
        let batch = bulk_batch(ids.clone(), NotificationChannel::Sms);
        worker.enqueue_batch(batch.clone()).await.unwrap();

        let outcome = worker.cancel_batch(&batch.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Removed);

        assert!(queue.jobs.lock().unwrap().is_empty());
        for id in ids {
            assert_eq!(
                repo.notification_status(id),
                Some(NotificationStatus::Cancelled)
            );
        }
        assert_eq!(
            repo.batch_record(&batch.id).unwrap().status,
            BatchStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_batch_errors() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let worker = worker(queue, repo, Arc::new(ScriptedSender::ok()), clock());

        let result = worker.cancel_batch("batch-nope").await;
        assert!(matches!(result, Err(NotificationError::BatchNotFound(_))));
    }

    #[tokio::test]
    async fn test_user_batch_rescheduled_during_quiet_hours() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());

        let user_id = Uuid::new_v4();
        let mut prefs = crate::models::UserPreferences::new(user_id);
        prefs.quiet_hours = Some(crate::models::QuietHours::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        ));
        repo.insert_preferences(prefs);

        let ids = seed_notifications(&repo, 2, NotificationChannel::Email, NotificationPriority::Normal);

        // 23:00 UTC is inside the window; the end boundary is 8h away
        let fixed = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        let worker = worker(queue.clone(), repo.clone(), sender.clone(), Arc::new(FixedClock(fixed)));

        let batch = BatchJob::new(
            BatchType::UserBatch,
            ids,
            Some(NotificationChannel::Email),
            NotificationPriority::Normal,
            BatchOptions::default(),
        )
        .with_metadata(json!({ "userId": user_id.to_string() }));

        let outcome = worker
            .process_batch(BatchType::UserBatch, batch.clone())
            .await
            .unwrap();

        assert_eq!(outcome.rescheduled_ms, Some(8 * 3_600_000));
        assert_eq!(sender.sent_count(), 0);

        let readds = queue.added_named("user-batch");
        assert_eq!(readds.len(), 1);
        assert_eq!(readds[0].1.delay, 8 * 3_600_000);
    }

    #[tokio::test]
    async fn test_priority_batch_retries_once_then_succeeds() {
        use crate::repository::MockNotificationRepository;

        let queue = TestQueue::new();
        let id = Uuid::new_v4();
        let notification = Notification::new(
            Uuid::new_v4(),
            NotificationChannel::Push,
            NotificationPriority::Critical,
            "urgent",
            json!({}),
        );
        let mut fetched = notification.clone();
        fetched.id = id;

        let mut repo = MockNotificationRepository::new();
        repo.expect_find_by_id()
            .returning(move |_| Ok(Some(fetched.clone())));
        repo.expect_update_status().returning(|_, _| Ok(()));
        repo.expect_update_batch_status().returning(|_, _, _| Ok(()));
        repo.expect_create_batch_record().returning(|_| Ok(()));

        // First send fails, the immediate retry succeeds
        let mut sender = MockNotificationSender::new();
        let mut first = true;
        sender.expect_send().times(2).returning(move |_| {
            if first {
                first = false;
                Err(NotificationError::Send("blip".to_string()))
            } else {
                Ok(())
            }
        });

        let worker = worker(queue, Arc::new(repo), Arc::new(sender), clock());

        let mut batch = BatchJob::new(
            BatchType::PriorityBatch,
            vec![id],
            None,
            NotificationPriority::Critical,
            BatchOptions::default(),
        );
        batch.processing_options.delay_between_items_ms = 0;

        let outcome = worker
            .process_batch(BatchType::PriorityBatch, batch)
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_auto_collect_groups_by_channel_and_priority() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());

        // 12 normal email + 3 low sms -> email chunked by batch_size 10
        seed_notifications(&repo, 12, NotificationChannel::Email, NotificationPriority::Normal);
        seed_notifications(&repo, 3, NotificationChannel::Sms, NotificationPriority::Low);
        // 2 elevated -> one priority batch
        seed_notifications(&repo, 2, NotificationChannel::Push, NotificationPriority::Critical);

        let worker = worker(queue.clone(), repo.clone(), sender, clock());
        let enqueued = worker.auto_collect().await.unwrap();

        // email: 2 chunks (10 + 2), sms: 1 chunk, priority: 1
        assert_eq!(enqueued, 4);

        let bulk = queue.added_named("bulk-notification");
        assert_eq!(bulk.len(), 3);
        for (data, _) in &bulk {
            let batch: BatchJob = serde_json::from_value(data.clone()).unwrap();
            let expected = BatchOptions::for_channel(batch.channel.unwrap());
            assert_eq!(batch.processing_options.delay_between_items_ms, expected.delay_between_items_ms);
        }

        let priority = queue.added_named("priority-batch");
        assert_eq!(priority.len(), 1);
        let batch: BatchJob = serde_json::from_value(priority[0].0.clone()).unwrap();
        assert_eq!(batch.notification_ids.len(), 2);
        assert_eq!(batch.processing_options.delay_between_items_ms, 50);
        // 2x the worker concurrency (2 in this config)
        assert_eq!(batch.processing_options.max_concurrency, 4);
    }

    #[tokio::test]
    async fn test_start_registers_schedule_and_tolerates_existing() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let worker = worker(queue.clone(), repo, Arc::new(ScriptedSender::ok()), clock());

        worker.start().await.unwrap();

        let collects = queue.added_named(AUTO_COLLECT_JOB_ID);
        assert_eq!(collects.len(), 1);
        let repeat = collects[0].1.repeat.clone().unwrap();
        assert_eq!(repeat.every, Some(60_000));
        assert!(repeat.immediately);
    }

    #[tokio::test]
    async fn test_batch_events_emitted() {
        let queue = TestQueue::new();
        let repo = Arc::new(InMemoryRepository::new());
        let sender = Arc::new(ScriptedSender::ok());
        let ids = seed_notifications(&repo, 2, NotificationChannel::InApp, NotificationPriority::Normal);

        let worker = worker(queue, repo, sender, clock());
        let mut events = worker.subscribe();

        let batch = bulk_batch(ids, NotificationChannel::InApp);
        worker.enqueue_batch(batch.clone()).await.unwrap();
        worker
            .process_batch(BatchType::BulkNotification, batch.clone())
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "batch_status_changed");
        let BatchEvent::StatusChanged { batch_id, status, progress } = event;
        assert_eq!(batch_id, batch.id);
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(progress.processed, 2);
    }
}

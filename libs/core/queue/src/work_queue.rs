//! Redis-backed work queue.
//!
//! This backend keeps jobs in Redis structures keyed by a prefix and the
//! queue name:
//! - `:jobs` hash of serialized job records
//! - `:wait:{name}:{p}` one list per processor name and priority bucket
//! - `:delayed` sorted set of job ids scored by earliest-run-at
//! - `:active` / `:stuck` sets, `:completed` / `:failed` sorted sets
//! - `:heartbeat` hash of active-job heartbeats for stalled detection
//!
//! Dispatch loops pop the lowest non-empty priority bucket (FIFO within a
//! bucket), a promoter task moves due delayed jobs into their bucket, and a
//! startup scan requeues jobs whose heartbeat went silent.

use crate::backoff::compute_backoff;
use crate::config::{BrokerKind, QueueConfig};
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobOptions, JobProgress, JobState, PRIORITY_LEVELS, Repeat};
use crate::metrics::{self, JobOutcome, QueueMetricsSnapshot, ThroughputTracker};
use crate::queue::{JobCounts, NewJob, Processor, Queue};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often an active job refreshes its heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Heartbeats older than this mark a job as stalled.
const STALLED_THRESHOLD_MS: i64 = 30_000;

/// Idle poll interval for dispatch loops.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `close()` waits for in-flight work before abandoning it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Redis key layout for one queue.
#[derive(Debug, Clone)]
struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}:{}", prefix, queue),
        }
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.base)
    }

    fn names(&self) -> String {
        format!("{}:names", self.base)
    }

    fn wait(&self, name: &str, priority: u8) -> String {
        format!("{}:wait:{}:{}", self.base, name, priority)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn stuck(&self) -> String {
        format!("{}:stuck", self.base)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    fn heartbeat(&self) -> String {
        format!("{}:heartbeat", self.base)
    }

    fn meta(&self) -> String {
        format!("{}:meta", self.base)
    }

    fn terminal(&self, state: JobState) -> String {
        match state {
            JobState::Completed => self.completed(),
            _ => self.failed(),
        }
    }
}

struct WorkQueueInner {
    config: QueueConfig,
    redis: ConnectionManager,
    keys: Keys,
    events: EventBus,
    processors: std::sync::Mutex<HashSet<String>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    paused: AtomicBool,
    closed: AtomicBool,
    tracker: std::sync::Mutex<ThroughputTracker>,
}

/// Redis-backed [`Queue`] implementation.
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

impl WorkQueue {
    /// Connect to Redis and initialize the queue.
    ///
    /// Recovers stalled jobs left behind by a previous run, restores the
    /// paused flag, and starts the delayed-job promoter.
    pub async fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis.url())
            .map_err(|e| QueueError::Config(format!("invalid redis url: {}", e)))?;

        let connect = client.get_connection_manager();
        let redis = tokio::time::timeout(
            Duration::from_millis(config.redis.connect_timeout_ms),
            connect,
        )
        .await
        .map_err(|_| QueueError::Connection("redis connect timed out".to_string()))??;

        if config.redis.ready_check {
            let mut conn = redis.clone();
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            if pong != "PONG" {
                return Err(QueueError::Connection(format!(
                    "unexpected PING response: {}",
                    pong
                )));
            }
        }

        let keys = Keys::new(&config.prefix, &config.name);
        let (shutdown_tx, _) = watch::channel(false);
        let window = Duration::from_millis(config.metrics_interval_ms);

        let inner = Arc::new(WorkQueueInner {
            keys,
            redis,
            events: EventBus::new(),
            processors: std::sync::Mutex::new(HashSet::new()),
            workers: std::sync::Mutex::new(Vec::new()),
            timers: std::sync::Mutex::new(Vec::new()),
            shutdown_tx,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tracker: std::sync::Mutex::new(ThroughputTracker::new(window)),
            config,
        });

        inner.restore_paused_flag().await?;

        if let Err(e) = inner.recover_stalled_jobs().await {
            warn!(queue = %inner.config.name, error = %e, "Failed to recover stalled jobs on startup");
        }

        let promoter = tokio::spawn(Self::promoter_loop(Arc::clone(&inner)));
        inner.timers.lock().unwrap().push(promoter);

        info!(
            queue = %inner.config.name,
            prefix = %inner.config.prefix,
            "Work queue ready"
        );
        inner.events.publish(QueueEvent::Ready);

        Ok(Self { inner })
    }

    /// Move due delayed jobs into their priority buckets, waking at the
    /// nearest deadline. Deadlines are absolute, so a clock jumping forward
    /// promotes promptly and a clock jumping back simply waits again.
    async fn promoter_loop(inner: Arc<WorkQueueInner>) {
        let mut shutdown = inner.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match inner.promote_due_jobs().await {
                Ok(next_deadline_ms) => next_deadline_ms
                    .map(|ms| Duration::from_millis(ms.min(1_000)))
                    .unwrap_or(Duration::from_secs(1)),
                Err(e) => {
                    debug!(queue = %inner.config.name, error = %e, "Promoter pass failed");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn worker_loop(inner: Arc<WorkQueueInner>, name: String, processor: Arc<dyn Processor>) {
        let mut shutdown = inner.shutdown_tx.subscribe();
        let mut was_busy = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if inner.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            match inner.pop_next(&name).await {
                Ok(Some(job_id)) => {
                    was_busy = true;
                    inner.run_job(&job_id, &processor).await;
                }
                Ok(None) => {
                    if was_busy {
                        was_busy = false;
                        inner.events.publish(QueueEvent::Drained);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    if e.is_connection_error() {
                        warn!(queue = %inner.config.name, error = %e, "Redis error in dispatch, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    } else {
                        error!(queue = %inner.config.name, error = %e, "Dispatch error");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        }

        debug!(queue = %inner.config.name, processor = %name, "Worker loop stopped");
    }

    /// Repeat scheduler: spawns a child job per tick until the limit or end
    /// date is reached.
    async fn repeat_loop(inner: Arc<WorkQueueInner>, template: Job, repeat: Repeat) {
        let mut shutdown = inner.shutdown_tx.subscribe();
        let every = repeat.every.unwrap_or(0).max(1);
        let mut spawned: u32 = 0;

        if let Some(start) = repeat.start_date {
            let wait = (start - Utc::now()).num_milliseconds();
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait as u64)).await;
            }
        }

        if repeat.immediately {
            match inner.enqueue_repeat_child(&template).await {
                Ok(_) => spawned += 1,
                Err(e) => {
                    warn!(queue = %inner.config.name, error = %e, "Failed to enqueue immediate repeat child");
                }
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(every));
        // The first tick completes immediately; consume it so children start
        // one full interval after registration.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(limit) = repeat.limit
                        && spawned >= limit
                    {
                        break;
                    }
                    if let Some(end) = repeat.end_date
                        && Utc::now() > end
                    {
                        break;
                    }
                    match inner.enqueue_repeat_child(&template).await {
                        Ok(_) => spawned += 1,
                        Err(e) => {
                            warn!(queue = %inner.config.name, error = %e, "Failed to enqueue repeat child");
                        }
                    }
                }
            }
        }

        debug!(queue = %inner.config.name, job = %template.id, spawned, "Repeat schedule finished");
    }
}

impl WorkQueueInner {
    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    async fn restore_paused_flag(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let paused: Option<String> = redis::cmd("HGET")
            .arg(self.keys.meta())
            .arg("paused")
            .query_async(&mut conn)
            .await?;
        self.paused
            .store(paused.as_deref() == Some("1"), Ordering::SeqCst);
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let json = serde_json::to_string(job)?;
        redis::cmd("HSET")
            .arg(self.keys.jobs())
            .arg(&job.id)
            .arg(json)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn();
        let json: Option<String> = redis::cmd("HGET")
            .arg(self.keys.jobs())
            .arg(id)
            .query_async(&mut conn)
            .await?;

        match json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    // Corrupt payloads are skipped, never silently re-run
                    warn!(job_id = %id, error = %e, "Unparseable job record, skipping");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn push_waiting(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("RPUSH")
            .arg(self.keys.wait(&job.name, job.opts.priority))
            .arg(&job.id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn register_name(&self, name: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("SADD")
            .arg(self.keys.names())
            .arg(name)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn known_names(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.names())
            .query_async(&mut conn)
            .await?;
        Ok(names)
    }

    /// Pop the next job id for `name`, lowest priority bucket first.
    async fn pop_next(&self, name: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn();
        for priority in 0..PRIORITY_LEVELS {
            let id: Option<String> = redis::cmd("LPOP")
                .arg(self.keys.wait(name, priority))
                .query_async(&mut conn)
                .await?;
            if id.is_some() {
                return Ok(id);
            }
        }
        Ok(None)
    }

    /// Promote due delayed jobs; returns the distance to the next deadline.
    async fn promote_due_jobs(&self) -> Result<Option<u64>, QueueError> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.delayed())
            .arg("-inf")
            .arg(now_ms)
            .query_async(&mut conn)
            .await?;

        for id in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.keys.delayed())
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue; // someone else (promote_job) took it
            }

            match self.load_job(&id).await? {
                Some(mut job) => {
                    job.mark_waiting();
                    self.save_job(&job).await?;
                    self.push_waiting(&job).await?;
                    debug!(job_id = %id, "Promoted delayed job to waiting");
                }
                None => {
                    debug!(job_id = %id, "Delayed job record missing, dropping");
                }
            }
        }

        let next: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.keys.delayed())
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(next
            .first()
            .map(|(_, score)| (*score as i64 - now_ms).max(0) as u64))
    }

    /// Requeue active jobs whose heartbeat went silent, keeping their
    /// attempt count.
    async fn recover_stalled_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn();
        let active: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.active())
            .query_async(&mut conn)
            .await?;

        let now_ms = Utc::now().timestamp_millis();
        let mut recovered = 0;

        for id in active {
            let beat: Option<i64> = redis::cmd("HGET")
                .arg(self.keys.heartbeat())
                .arg(&id)
                .query_async(&mut conn)
                .await?;

            let stalled = beat.map(|b| now_ms - b > STALLED_THRESHOLD_MS).unwrap_or(true);
            if !stalled {
                continue;
            }

            redis::cmd("SREM")
                .arg(self.keys.active())
                .arg(&id)
                .query_async::<()>(&mut conn)
                .await?;
            redis::cmd("HDEL")
                .arg(self.keys.heartbeat())
                .arg(&id)
                .query_async::<()>(&mut conn)
                .await?;

            if let Some(mut job) = self.load_job(&id).await? {
                job.mark_waiting();
                self.save_job(&job).await?;
                self.push_waiting(&job).await?;
                self.events.publish(QueueEvent::JobStalled { job_id: id.clone() });
                metrics::record_job_processed(&self.config.name, BrokerKind::Redis, JobOutcome::Stalled);
                recovered += 1;
                warn!(job_id = %id, "Requeued stalled job");
            }
        }

        if recovered > 0 {
            info!(queue = %self.config.name, count = recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    async fn refresh_heartbeat(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(self.keys.heartbeat())
            .arg(id)
            .arg(Utc::now().timestamp_millis())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn run_job(&self, id: &str, processor: &Arc<dyn Processor>) {
        let mut job = match self.load_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return, // removed while waiting
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to load job");
                return;
            }
        };

        let mut conn = self.conn();
        if let Err(e) = redis::cmd("SADD")
            .arg(self.keys.active())
            .arg(id)
            .query_async::<()>(&mut conn)
            .await
        {
            error!(job_id = %id, error = ?e, "Failed to mark job active");
            return;
        }
        let _ = self.refresh_heartbeat(id).await;

        job.mark_active();
        if let Err(e) = self.save_job(&job).await {
            error!(job_id = %id, error = %e, "Failed to persist active state");
        }
        self.events.publish(QueueEvent::JobActive { job_id: id.to_string() });

        debug!(job_id = %id, name = %job.name, attempt = job.attempts_made + 1, "Processing job");

        let started = std::time::Instant::now();
        let result = self.execute(&job, processor).await;
        let elapsed = started.elapsed();

        // Leaving the active set happens regardless of the outcome
        let mut conn = self.conn();
        let _ = redis::cmd("SREM")
            .arg(self.keys.active())
            .arg(id)
            .query_async::<()>(&mut conn)
            .await;
        let _ = redis::cmd("HDEL")
            .arg(self.keys.heartbeat())
            .arg(id)
            .query_async::<()>(&mut conn)
            .await;

        job.attempts_made += 1;

        match result {
            Ok(return_value) => {
                if let Err(e) = self.settle_completed(&mut job, return_value, elapsed).await {
                    error!(job_id = %id, error = %e, "Failed to settle completed job");
                }
            }
            Err(err) => {
                if let Err(e) = self.settle_failed(&mut job, err).await {
                    error!(job_id = %id, error = %e, "Failed to settle failed job");
                }
            }
        }
    }

    /// Drive the processor with heartbeat refreshes and the optional
    /// per-job timeout.
    async fn execute(
        &self,
        job: &Job,
        processor: &Arc<dyn Processor>,
    ) -> Result<serde_json::Value, QueueError> {
        let mut process_fut = processor.process(job.clone());
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // immediate first tick

        let timeout_fut = async {
            match job.opts.timeout {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);

        loop {
            tokio::select! {
                result = &mut process_fut => break result,
                _ = &mut timeout_fut => {
                    break Err(QueueError::Timeout(format!(
                        "processor exceeded {}ms",
                        job.opts.timeout.unwrap_or_default()
                    )));
                }
                _ = heartbeat.tick() => {
                    let _ = self.refresh_heartbeat(&job.id).await;
                }
            }
        }
    }

    async fn settle_completed(
        &self,
        job: &mut Job,
        return_value: serde_json::Value,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        job.mark_completed(return_value.clone());
        self.apply_retention(job, JobState::Completed).await?;

        self.events.publish(QueueEvent::JobCompleted {
            job_id: job.id.clone(),
            return_value: Some(return_value),
        });
        metrics::record_job_processed(&self.config.name, BrokerKind::Redis, JobOutcome::Completed);
        metrics::record_job_duration(&self.config.name, elapsed);
        self.tracker
            .lock()
            .unwrap()
            .record_processed(elapsed.as_millis() as u64);

        debug!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
        Ok(())
    }

    async fn settle_failed(&self, job: &mut Job, err: QueueError) -> Result<(), QueueError> {
        let category = err.category();
        let retryable = category.should_retry() && job.can_retry() && !err.is_cancelled();

        if retryable {
            let delay_ms = compute_backoff(job.attempts_made, &job.opts.backoff);
            let run_at = Utc::now().timestamp_millis() + delay_ms as i64;

            job.state = JobState::Delayed;
            job.failed_reason = Some(err.to_string());
            job.stacktrace.push(err.to_string());
            self.save_job(job).await?;

            let mut conn = self.conn();
            redis::cmd("ZADD")
                .arg(self.keys.delayed())
                .arg(run_at)
                .arg(&job.id)
                .query_async::<()>(&mut conn)
                .await?;

            metrics::record_retry(&self.config.name, job.attempts_made);
            metrics::record_job_processed(&self.config.name, BrokerKind::Redis, JobOutcome::Retried);

            info!(
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.opts.attempts,
                delay_ms,
                error = %err,
                "Scheduling retry with backoff"
            );
            return Ok(());
        }

        job.mark_failed(err.to_string());
        self.apply_retention(job, JobState::Failed).await?;

        self.events.publish(QueueEvent::JobFailed {
            job_id: job.id.clone(),
            reason: err.to_string(),
            attempts_made: job.attempts_made,
        });
        metrics::record_job_processed(&self.config.name, BrokerKind::Redis, JobOutcome::Failed);
        metrics::record_error(&self.config.name, category_label(category));
        self.tracker.lock().unwrap().record_error();

        warn!(
            job_id = %job.id,
            attempts_made = job.attempts_made,
            error = %err,
            "Job failed terminally"
        );
        Ok(())
    }

    /// Honor `remove_on_complete` / `remove_on_fail` on terminal settle.
    async fn apply_retention(&self, job: &Job, state: JobState) -> Result<(), QueueError> {
        use crate::job::Retention;

        let retention = match state {
            JobState::Completed => job.opts.remove_on_complete,
            _ => job.opts.remove_on_fail,
        };
        let key = self.keys.terminal(state);
        let mut conn = self.conn();

        match retention {
            Retention::Remove => {
                redis::cmd("HDEL")
                    .arg(self.keys.jobs())
                    .arg(&job.id)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            Retention::Keep => {
                self.save_job(job).await?;
                redis::cmd("ZADD")
                    .arg(&key)
                    .arg(Utc::now().timestamp_millis())
                    .arg(&job.id)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            Retention::KeepLast(n) => {
                self.save_job(job).await?;
                redis::cmd("ZADD")
                    .arg(&key)
                    .arg(Utc::now().timestamp_millis())
                    .arg(&job.id)
                    .query_async::<()>(&mut conn)
                    .await?;

                let count: i64 = redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;
                let excess = count - n as i64;
                if excess > 0 {
                    let evicted: Vec<String> = redis::cmd("ZPOPMIN")
                        .arg(&key)
                        .arg(excess)
                        .query_async::<Vec<(String, f64)>>(&mut conn)
                        .await?
                        .into_iter()
                        .map(|(id, _)| id)
                        .collect();
                    if !evicted.is_empty() {
                        redis::cmd("HDEL")
                            .arg(self.keys.jobs())
                            .arg(&evicted)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn enqueue_repeat_child(&self, template: &Job) -> Result<Job, QueueError> {
        let child = template.repeat_child();
        self.save_job(&child).await?;
        self.push_waiting(&child).await?;
        self.events.publish(QueueEvent::JobAdded {
            job_id: child.id.clone(),
            name: child.name.clone(),
        });
        Ok(child)
    }

    async fn ids_for_state(&self, state: JobState) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();
        let ids = match state {
            JobState::Waiting | JobState::Paused => {
                let mut ids = Vec::new();
                for name in self.known_names().await? {
                    for priority in 0..PRIORITY_LEVELS {
                        let bucket: Vec<String> = redis::cmd("LRANGE")
                            .arg(self.keys.wait(&name, priority))
                            .arg(0)
                            .arg(-1)
                            .query_async(&mut conn)
                            .await?;
                        ids.extend(bucket);
                    }
                }
                ids
            }
            JobState::Delayed => {
                redis::cmd("ZRANGE")
                    .arg(self.keys.delayed())
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
            JobState::Active => {
                redis::cmd("SMEMBERS")
                    .arg(self.keys.active())
                    .query_async(&mut conn)
                    .await?
            }
            JobState::Stuck => {
                redis::cmd("SMEMBERS")
                    .arg(self.keys.stuck())
                    .query_async(&mut conn)
                    .await?
            }
            JobState::Completed | JobState::Failed => {
                redis::cmd("ZRANGE")
                    .arg(self.keys.terminal(state))
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?
            }
        };
        Ok(ids)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn();
        let mut counts = JobCounts::default();

        for name in self.known_names().await? {
            for priority in 0..PRIORITY_LEVELS {
                let len: u64 = redis::cmd("LLEN")
                    .arg(self.keys.wait(&name, priority))
                    .query_async(&mut conn)
                    .await?;
                counts.waiting += len;
            }
        }
        counts.delayed = redis::cmd("ZCARD")
            .arg(self.keys.delayed())
            .query_async(&mut conn)
            .await?;
        counts.active = redis::cmd("SCARD")
            .arg(self.keys.active())
            .query_async(&mut conn)
            .await?;
        counts.stuck = redis::cmd("SCARD")
            .arg(self.keys.stuck())
            .query_async(&mut conn)
            .await?;
        counts.completed = redis::cmd("ZCARD")
            .arg(self.keys.completed())
            .query_async(&mut conn)
            .await?;
        counts.failed = redis::cmd("ZCARD")
            .arg(self.keys.failed())
            .query_async(&mut conn)
            .await?;

        Ok(counts)
    }

    /// Remove a job id from every structure it could live in.
    async fn purge_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn();

        redis::cmd("LREM")
            .arg(self.keys.wait(&job.name, job.opts.priority))
            .arg(0)
            .arg(&job.id)
            .query_async::<()>(&mut conn)
            .await?;
        for key in [self.keys.delayed(), self.keys.completed(), self.keys.failed()] {
            redis::cmd("ZREM")
                .arg(key)
                .arg(&job.id)
                .query_async::<()>(&mut conn)
                .await?;
        }
        for key in [self.keys.active(), self.keys.stuck()] {
            redis::cmd("SREM")
                .arg(key)
                .arg(&job.id)
                .query_async::<()>(&mut conn)
                .await?;
        }
        redis::cmd("HDEL")
            .arg(self.keys.heartbeat())
            .arg(&job.id)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("HDEL")
            .arg(self.keys.jobs())
            .arg(&job.id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn add_job(&self, name: &str, data: serde_json::Value, opts: JobOptions) -> Result<Job, QueueError> {
        self.ensure_open()?;
        opts.validate()?;

        if let Some(job_id) = &opts.job_id {
            if let Some(existing) = self.load_job(job_id).await? {
                if !existing.is_terminal() {
                    return Err(QueueError::JobExists(job_id.clone()));
                }
            }
        }

        let mut job = Job::new(name, data, opts);
        self.register_name(name).await?;

        if job.opts.repeat.is_some() {
            // The template itself is never dispatched; the scheduler spawns
            // child jobs per tick.
            job.state = JobState::Delayed;
            self.save_job(&job).await?;
        } else if job.state == JobState::Delayed {
            self.save_job(&job).await?;
            let mut conn = self.conn();
            redis::cmd("ZADD")
                .arg(self.keys.delayed())
                .arg(job.earliest_run_at().timestamp_millis())
                .arg(&job.id)
                .query_async::<()>(&mut conn)
                .await?;
        } else {
            self.save_job(&job).await?;
            self.push_waiting(&job).await?;
        }

        self.events.publish(QueueEvent::JobAdded {
            job_id: job.id.clone(),
            name: job.name.clone(),
        });
        debug!(job_id = %job.id, name = %job.name, state = %job.state, "Added job");

        Ok(job)
    }
}

fn category_label(category: crate::error::ErrorCategory) -> &'static str {
    match category {
        crate::error::ErrorCategory::Transient => "transient",
        crate::error::ErrorCategory::Permanent => "permanent",
        crate::error::ErrorCategory::RateLimited => "rate_limited",
    }
}

#[async_trait]
impl Queue for WorkQueue {
    fn name(&self) -> &str {
        &self.inner.config.name
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
        let job = self.inner.add_job(name, data, opts).await?;

        if let Some(repeat) = job.opts.repeat.clone() {
            let handle = tokio::spawn(Self::repeat_loop(
                Arc::clone(&self.inner),
                job.clone(),
                repeat,
            ));
            self.inner.timers.lock().unwrap().push(handle);
        }

        Ok(job)
    }

    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Vec<Result<Job, QueueError>> {
        let mut results = Vec::with_capacity(jobs.len());
        for entry in jobs {
            results.push(self.add(&entry.name, entry.data, entry.opts).await);
        }
        results
    }

    async fn process(
        &self,
        name: &str,
        concurrency: usize,
        processor: Arc<dyn Processor>,
    ) -> Result<(), QueueError> {
        self.inner.ensure_open()?;

        {
            let mut registered = self.inner.processors.lock().unwrap();
            if !registered.insert(name.to_string()) {
                return Err(QueueError::ProcessorExists(name.to_string()));
            }
        }
        self.inner.register_name(name).await?;

        let concurrency = concurrency.max(1);
        let mut workers = self.inner.workers.lock().unwrap();
        for _ in 0..concurrency {
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            let processor = Arc::clone(&processor);
            workers.push(tokio::spawn(WorkQueue::worker_loop(inner, name, processor)));
        }

        info!(
            queue = %self.inner.config.name,
            processor = %name,
            concurrency,
            "Registered processor"
        );
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.inner.load_job(id).await
    }

    async fn get_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::new();
        for state in states {
            for id in self.inner.ids_for_state(*state).await? {
                if let Some(job) = self.inner.load_job(&id).await? {
                    if job.state == *state {
                        jobs.push(job);
                    }
                }
            }
        }

        let end = end.min(jobs.len());
        let start = start.min(end);
        Ok(jobs[start..end].to_vec())
    }

    async fn get_job_counts(&self) -> Result<JobCounts, QueueError> {
        self.inner.counts().await
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn();
        redis::cmd("HSET")
            .arg(self.inner.keys.meta())
            .arg("paused")
            .arg("1")
            .query_async::<()>(&mut conn)
            .await?;
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.events.publish(QueueEvent::Paused);
        info!(queue = %self.inner.config.name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn();
        redis::cmd("HSET")
            .arg(self.inner.keys.meta())
            .arg("paused")
            .arg("0")
            .query_async::<()>(&mut conn)
            .await?;
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.events.publish(QueueEvent::Resumed);
        info!(queue = %self.inner.config.name, "Queue resumed");
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    async fn clean(
        &self,
        grace_ms: u64,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, QueueError> {
        let states = match state {
            Some(s) if s.is_terminal() => vec![s],
            Some(s) => {
                return Err(QueueError::Config(format!(
                    "clean only applies to terminal states, got '{}'",
                    s
                )));
            }
            None => vec![JobState::Completed, JobState::Failed],
        };

        let cutoff = Utc::now().timestamp_millis() - grace_ms as i64;
        let mut removed = Vec::new();
        let mut budget = limit.unwrap_or(usize::MAX);
        let mut conn = self.inner.conn();

        for s in states {
            if budget == 0 {
                break;
            }
            let key = self.inner.keys.terminal(s);
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(cutoff)
                .arg("LIMIT")
                .arg(0)
                .arg(budget.min(i64::MAX as usize) as i64)
                .query_async(&mut conn)
                .await?;

            for id in ids {
                redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&id)
                    .query_async::<()>(&mut conn)
                    .await?;
                redis::cmd("HDEL")
                    .arg(self.inner.keys.jobs())
                    .arg(&id)
                    .query_async::<()>(&mut conn)
                    .await?;
                removed.push(id);
                budget -= 1;
            }
        }

        self.inner
            .events
            .publish(QueueEvent::Cleaned { removed: removed.len() });
        info!(queue = %self.inner.config.name, count = removed.len(), "Cleaned terminal jobs");
        Ok(removed)
    }

    async fn empty(&self) -> Result<(), QueueError> {
        // Cancel repeat schedulers and the promoter; the promoter is
        // restarted below since empty() leaves the queue usable.
        {
            let mut timers = self.inner.timers.lock().unwrap();
            for handle in timers.drain(..) {
                handle.abort();
            }
        }

        let mut conn = self.inner.conn();
        let mut queued_ids: Vec<String> = Vec::new();

        for name in self.inner.known_names().await? {
            for priority in 0..PRIORITY_LEVELS {
                let key = self.inner.keys.wait(&name, priority);
                let ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await?;
                queued_ids.extend(ids);
                redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await?;
            }
        }

        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.inner.keys.delayed())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        queued_ids.extend(delayed);
        redis::cmd("DEL")
            .arg(self.inner.keys.delayed())
            .query_async::<()>(&mut conn)
            .await?;

        if !queued_ids.is_empty() {
            redis::cmd("HDEL")
                .arg(self.inner.keys.jobs())
                .arg(&queued_ids)
                .query_async::<()>(&mut conn)
                .await?;
        }

        let promoter = tokio::spawn(WorkQueue::promoter_loop(Arc::clone(&self.inner)));
        self.inner.timers.lock().unwrap().push(promoter);

        info!(queue = %self.inner.config.name, discarded = queued_ids.len(), "Emptied queue");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.inner.shutdown_tx.send(true);

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.workers.lock().unwrap();
            guard.drain(..).collect()
        };

        let drain = async {
            for handle in workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(queue = %self.inner.config.name, "Drain timeout elapsed, abandoning in-flight jobs");
        }

        {
            let mut timers = self.inner.timers.lock().unwrap();
            for handle in timers.drain(..) {
                handle.abort();
            }
        }

        // Whatever is still active was abandoned mid-flight
        let mut conn = self.inner.conn();
        let abandoned: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.inner.keys.active())
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        for id in abandoned {
            if let Ok(Some(mut job)) = self.inner.load_job(&id).await {
                job.state = JobState::Stuck;
                let _ = self.inner.save_job(&job).await;
            }
            let _ = redis::cmd("SMOVE")
                .arg(self.inner.keys.active())
                .arg(self.inner.keys.stuck())
                .arg(&id)
                .query_async::<()>(&mut conn)
                .await;
        }

        info!(queue = %self.inner.config.name, "Work queue closed");
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetricsSnapshot, QueueError> {
        let counts = self.inner.counts().await?;
        let paused = self.is_paused();
        let snapshot = self.inner.tracker.lock().unwrap().snapshot(
            &self.inner.config.name,
            BrokerKind::Redis,
            counts,
            paused,
        );
        Ok(snapshot)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    async fn update_job(&self, id: &str, data: serde_json::Value) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.data = data;
        self.inner.save_job(&job).await
    }

    async fn job_progress(&self, id: &str, progress: JobProgress) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.progress = progress.clone();
        self.inner.save_job(&job).await?;
        self.inner.events.publish(QueueEvent::JobProgress {
            job_id: id.to_string(),
            progress,
        });
        Ok(())
    }

    async fn job_log(&self, id: &str, message: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.logs.push(message.to_string());
        self.inner.save_job(&job).await
    }

    async fn remove_job(&self, id: &str) -> Result<(), QueueError> {
        match self.inner.load_job(id).await? {
            Some(job) => {
                self.inner.purge_job(&job).await?;
                self.inner
                    .events
                    .publish(QueueEvent::JobRemoved { job_id: id.to_string() });
                Ok(())
            }
            // remove is idempotent
            None => Ok(()),
        }
    }

    async fn retry_job(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        if job.state != JobState::Failed {
            return Err(QueueError::Config(format!(
                "retry requires a failed job, '{}' is {}",
                id, job.state
            )));
        }

        let mut conn = self.inner.conn();
        redis::cmd("ZREM")
            .arg(self.inner.keys.failed())
            .arg(id)
            .query_async::<()>(&mut conn)
            .await?;

        // Explicit retry grants a fresh attempt budget
        job.attempts_made = 0;
        job.failed_reason = None;
        job.discarded = false;
        job.mark_waiting();
        self.inner.save_job(&job).await?;
        self.inner.push_waiting(&job).await?;

        info!(job_id = %id, "Returned failed job to waiting");
        Ok(())
    }

    async fn discard_job(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.discarded = true;
        self.inner.save_job(&job).await
    }

    async fn promote_job(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .load_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        if job.state != JobState::Delayed {
            return Err(QueueError::Config(format!(
                "promote requires a delayed job, '{}' is {}",
                id, job.state
            )));
        }

        let mut conn = self.inner.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.inner.keys.delayed())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            // The promoter got there first; nothing left to do
            return Ok(());
        }

        job.mark_waiting();
        self.inner.save_job(&job).await?;
        self.inner.push_waiting(&job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("dispatch", "mail");
        assert_eq!(keys.jobs(), "dispatch:mail:jobs");
        assert_eq!(keys.wait("send", 3), "dispatch:mail:wait:send:3");
        assert_eq!(keys.delayed(), "dispatch:mail:delayed");
        assert_eq!(keys.heartbeat(), "dispatch:mail:heartbeat");
        assert_eq!(keys.terminal(JobState::Completed), "dispatch:mail:completed");
        assert_eq!(keys.terminal(JobState::Failed), "dispatch:mail:failed");
    }

    #[test]
    fn test_category_labels() {
        use crate::error::ErrorCategory;
        assert_eq!(category_label(ErrorCategory::Transient), "transient");
        assert_eq!(category_label(ErrorCategory::Permanent), "permanent");
        assert_eq!(category_label(ErrorCategory::RateLimited), "rate_limited");
    }
}

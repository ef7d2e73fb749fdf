//! AMQP broker-backed queue.
//!
//! Wire model: one exchange per queue instance (direct by default) plus a
//! dead-letter exchange `<exchange>.dlx` bound to a parking queue for
//! terminally failed jobs. Each processor name gets its own AMQP queue
//! `<queue>.<name>` bound on the routing key `name`, consumed with
//! `prefetch = concurrency`.
//!
//! The canonical AMQP model has no native delay, so delayed and repeat jobs
//! are held by client-side timers that publish when due; timers survive
//! reconnects because every publish lazily re-establishes the connection
//! and re-asserts topology.

use crate::backoff::compute_backoff;
use crate::config::{BrokerKind, QueueConfig};
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobMessage, JobOptions, JobProgress, JobState, PRIORITY_LEVELS, Repeat};
use crate::metrics::{self, JobOutcome, QueueMetricsSnapshot, ThroughputTracker};
use crate::queue::{JobCounts, NewJob, Processor, Queue};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parking queue suffix for dead-lettered jobs.
const DEAD_LETTER_SUFFIX: &str = "dead-letter";

/// Pause backoff while a consumer is nack-requeueing deliveries.
const PAUSE_REQUEUE_DELAY: Duration = Duration::from_millis(200);

struct BrokerInner {
    config: QueueConfig,
    /// Live connection and channel, rebuilt on demand after failures.
    conn_state: tokio::sync::Mutex<Option<(Connection, Channel)>>,
    /// In-memory job index; the broker has no global job store.
    jobs: std::sync::Mutex<HashMap<String, Job>>,
    /// Registered processor names (also the declared AMQP queues).
    processors: std::sync::Mutex<HashMap<String, usize>>,
    consumers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Pending delayed publishes keyed by job id.
    timers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    repeat_timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    events: EventBus,
    paused: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tracker: std::sync::Mutex<ThroughputTracker>,
}

/// AMQP-backed [`Queue`] implementation.
pub struct BrokerQueue {
    inner: Arc<BrokerInner>,
}

impl BrokerQueue {
    /// Create the queue. The connection is established lazily on the first
    /// publish or consume, with the configured connection timeout.
    pub fn new(config: QueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let window = Duration::from_millis(config.metrics_interval_ms);

        let inner = Arc::new(BrokerInner {
            conn_state: tokio::sync::Mutex::new(None),
            jobs: std::sync::Mutex::new(HashMap::new()),
            processors: std::sync::Mutex::new(HashMap::new()),
            consumers: std::sync::Mutex::new(Vec::new()),
            timers: std::sync::Mutex::new(HashMap::new()),
            repeat_timers: std::sync::Mutex::new(Vec::new()),
            events: EventBus::new(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            tracker: std::sync::Mutex::new(ThroughputTracker::new(window)),
            config,
        });

        inner.events.publish(QueueEvent::Ready);
        Self { inner }
    }

    /// Supervisor for one processor: consumes until the transport drops,
    /// then reconnects after `reconnect_interval` and re-asserts topology.
    async fn consumer_supervisor(
        inner: Arc<BrokerInner>,
        name: String,
        concurrency: usize,
        processor: Arc<dyn Processor>,
    ) {
        let mut shutdown = inner.shutdown_tx.subscribe();
        let reconnect = Duration::from_millis(inner.config.amqp.reconnect_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match Self::consume_once(&inner, &name, concurrency, &processor, &mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(queue = %inner.config.name, processor = %name, "Consumer stream ended, resubscribing");
                }
                Err(e) => {
                    inner.invalidate_connection().await;
                    inner.events.publish(QueueEvent::Error {
                        message: e.to_string(),
                    });
                    warn!(
                        queue = %inner.config.name,
                        processor = %name,
                        error = %e,
                        reconnect_ms = reconnect.as_millis() as u64,
                        "Consumer error, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(reconnect) => {}
            }
        }

        debug!(queue = %inner.config.name, processor = %name, "Consumer supervisor stopped");
    }

    async fn consume_once(
        inner: &Arc<BrokerInner>,
        name: &str,
        concurrency: usize,
        processor: &Arc<dyn Processor>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let channel = inner.ensure_channel().await?;
        inner.assert_job_queue(&channel, name).await?;

        channel
            .basic_qos(concurrency as u16, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("{}-{}-{}", inner.config.name, name, Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                &inner.job_queue_name(name),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %inner.config.name,
            processor = %name,
            prefetch = concurrency,
            "Consuming"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let inner = Arc::clone(inner);
                            let processor = Arc::clone(processor);
                            // Prefetch caps the number of unacked deliveries,
                            // which bounds these tasks to `concurrency`.
                            tokio::spawn(async move {
                                BrokerQueue::handle_delivery(inner, delivery, processor).await;
                            });
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_delivery(
        inner: Arc<BrokerInner>,
        delivery: lapin::message::Delivery,
        processor: Arc<dyn Processor>,
    ) {
        if inner.paused.load(Ordering::SeqCst) {
            // Hand the delivery back while paused
            if let Err(e) = delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!(error = %e, "Failed to requeue delivery while paused");
            }
            tokio::time::sleep(PAUSE_REQUEUE_DELAY).await;
            return;
        }

        let message: JobMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                // Corrupt payloads are skipped with a warning, never re-run
                warn!(error = %e, "Unparseable message body, dropping");
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                return;
            }
        };

        let mut job = inner.take_or_adopt(message);
        job.mark_active();
        inner.index_put(job.clone());
        inner.events.publish(QueueEvent::JobActive {
            job_id: job.id.clone(),
        });

        debug!(job_id = %job.id, name = %job.name, attempt = job.attempts_made + 1, "Processing delivery");

        let started = std::time::Instant::now();
        let result = Self::execute(&job, &processor).await;
        let elapsed = started.elapsed();

        job.attempts_made += 1;

        match result {
            Ok(return_value) => {
                if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                    error!(job_id = %job.id, error = %e, "Failed to ack delivery");
                }

                job.mark_completed(return_value.clone());
                inner.settle_terminal(&job, JobState::Completed);

                inner.events.publish(QueueEvent::JobCompleted {
                    job_id: job.id.clone(),
                    return_value: Some(return_value),
                });
                metrics::record_job_processed(
                    &inner.config.name,
                    BrokerKind::RabbitMq,
                    JobOutcome::Completed,
                );
                metrics::record_job_duration(&inner.config.name, elapsed);
                inner
                    .tracker
                    .lock()
                    .unwrap()
                    .record_processed(elapsed.as_millis() as u64);
            }
            Err(err) => {
                let retryable =
                    err.category().should_retry() && job.can_retry() && !err.is_cancelled();

                if retryable {
                    // Retry by delayed re-publish; the original delivery is
                    // acked so it does not dead-letter.
                    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                        error!(job_id = %job.id, error = %e, "Failed to ack delivery before retry");
                    }

                    let delay_ms = compute_backoff(job.attempts_made, &job.opts.backoff);
                    job.state = JobState::Delayed;
                    job.failed_reason = Some(err.to_string());
                    job.stacktrace.push(err.to_string());
                    inner.index_put(job.clone());

                    metrics::record_retry(&inner.config.name, job.attempts_made);
                    metrics::record_job_processed(
                        &inner.config.name,
                        BrokerKind::RabbitMq,
                        JobOutcome::Retried,
                    );
                    info!(
                        job_id = %job.id,
                        attempt = job.attempts_made,
                        max_attempts = job.opts.attempts,
                        delay_ms,
                        error = %err,
                        "Scheduling delayed re-publish"
                    );

                    BrokerInner::schedule_publish(Arc::clone(&inner), job, delay_ms);
                } else {
                    job.mark_failed(err.to_string());
                    inner.settle_terminal(&job, JobState::Failed);

                    // Dead-letter the original delivery
                    if let Err(e) = delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await
                    {
                        error!(job_id = %job.id, error = %e, "Failed to nack delivery to DLX");
                    }

                    inner.events.publish(QueueEvent::JobFailed {
                        job_id: job.id.clone(),
                        reason: err.to_string(),
                        attempts_made: job.attempts_made,
                    });
                    metrics::record_job_processed(
                        &inner.config.name,
                        BrokerKind::RabbitMq,
                        JobOutcome::Failed,
                    );
                    inner.tracker.lock().unwrap().record_error();

                    warn!(
                        job_id = %job.id,
                        attempts_made = job.attempts_made,
                        error = %err,
                        "Job dead-lettered"
                    );
                }
            }
        }
    }

    /// Drive the processor under the optional per-job timeout.
    async fn execute(
        job: &Job,
        processor: &Arc<dyn Processor>,
    ) -> Result<serde_json::Value, QueueError> {
        match job.opts.timeout {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), processor.process(job.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(QueueError::Timeout(format!("processor exceeded {}ms", ms))),
                }
            }
            None => processor.process(job.clone()).await,
        }
    }

    async fn repeat_loop(inner: Arc<BrokerInner>, template: Job, repeat: Repeat) {
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
            if let Err(e) = inner.publish_child(&template).await {
                warn!(queue = %inner.config.name, error = %e, "Failed to publish immediate repeat child");
            } else {
                spawned += 1;
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(every));
        ticker.tick().await; // consume the immediate first tick

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
                    match inner.publish_child(&template).await {
                        Ok(_) => spawned += 1,
                        Err(e) => {
                            warn!(queue = %inner.config.name, error = %e, "Failed to publish repeat child");
                        }
                    }
                }
            }
        }

        debug!(queue = %inner.config.name, job = %template.id, spawned, "Repeat schedule finished");
    }
}

impl BrokerInner {
    fn exchange(&self) -> String {
        format!("{}.{}", self.config.amqp.exchange, self.config.name)
    }

    fn dlx(&self) -> String {
        format!("{}.dlx", self.exchange())
    }

    fn job_queue_name(&self, name: &str) -> String {
        format!("{}.{}", self.config.name, name)
    }

    fn parking_queue_name(&self) -> String {
        format!("{}.{}", self.config.name, DEAD_LETTER_SUFFIX)
    }

    /// AMQP priorities grow upward; ours grow downward. Flip on the wire so
    /// lower option values still win.
    fn amqp_priority(priority: u8) -> u8 {
        (PRIORITY_LEVELS - 1).saturating_sub(priority.min(PRIORITY_LEVELS - 1))
    }

    async fn invalidate_connection(&self) {
        let mut state = self.conn_state.lock().await;
        *state = None;
    }

    /// Get a usable channel, connecting and re-asserting topology on demand.
    async fn ensure_channel(&self) -> Result<Channel, QueueError> {
        let mut state = self.conn_state.lock().await;

        if let Some((connection, channel)) = state.as_ref()
            && connection.status().connected()
            && channel.status().connected()
        {
            return Ok(channel.clone());
        }

        let url = self.config.amqp.url();
        debug!(queue = %self.config.name, "Connecting to AMQP broker");

        let connect = Connection::connect(&url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_millis(self.config.amqp.connection_timeout_ms),
            connect,
        )
        .await
        .map_err(|_| QueueError::Connection("AMQP connect timed out".to_string()))??;

        let channel = connection.create_channel().await?;
        self.assert_topology(&channel).await?;

        info!(queue = %self.config.name, exchange = %self.exchange(), "AMQP connection established");
        *state = Some((connection, channel.clone()));
        Ok(channel)
    }

    /// Declare the exchange, the DLX, and the parking queue. Idempotent, so
    /// safe to repeat after every reconnect.
    async fn assert_topology(&self, channel: &Channel) -> Result<(), QueueError> {
        let amqp = &self.config.amqp;

        channel
            .exchange_declare(
                &self.exchange(),
                amqp.exchange_type.to_lapin(),
                ExchangeDeclareOptions {
                    durable: amqp.exchange_durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Fanout DLX catches every routing key
        channel
            .exchange_declare(
                &self.dlx(),
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.parking_queue_name(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.parking_queue_name(),
                &self.dlx(),
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Declare and bind the per-processor job queue.
    async fn assert_job_queue(&self, channel: &Channel, name: &str) -> Result<(), QueueError> {
        let amqp = &self.config.amqp;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dlx().into()),
        );
        args.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(PRIORITY_LEVELS as i32),
        );

        channel
            .queue_declare(
                &self.job_queue_name(name),
                QueueDeclareOptions {
                    durable: amqp.queue_durable,
                    exclusive: amqp.queue_exclusive,
                    auto_delete: amqp.queue_auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                &self.job_queue_name(name),
                &self.exchange(),
                name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Publish a job to its routing key with persistent delivery.
    async fn publish_job(&self, job: &Job) -> Result<(), QueueError> {
        let channel = self.ensure_channel().await?;
        self.assert_job_queue(&channel, &job.name).await?;

        let body = serde_json::to_vec(&JobMessage::from_job(job))?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_message_id(job.id.clone().into())
            .with_content_type("application/json".into())
            .with_priority(Self::amqp_priority(job.opts.priority));

        channel
            .basic_publish(
                &self.exchange(),
                &job.name,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        debug!(job_id = %job.id, routing_key = %job.name, "Published job");
        Ok(())
    }

    /// Hold a job in memory and publish it after `delay_ms`.
    fn schedule_publish(inner: Arc<Self>, mut job: Job, delay_ms: u64) {
        let id = job.id.clone();
        let task_inner = Arc::clone(&inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            job.mark_waiting();
            task_inner.index_put(job.clone());

            // publish_job reconnects on demand, so pending timers survive
            // transport drops
            if let Err(e) = task_inner.publish_job(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to publish delayed job");
                task_inner.events.publish(QueueEvent::Error {
                    message: e.to_string(),
                });
            }
            task_inner.timers.lock().unwrap().remove(&job.id);
        });

        if let Some(old) = inner.timers.lock().unwrap().insert(id, handle) {
            old.abort();
        }
    }

    async fn publish_child(&self, template: &Job) -> Result<Job, QueueError> {
        let child = template.repeat_child();
        self.index_put(child.clone());
        self.publish_job(&child).await?;
        self.events.publish(QueueEvent::JobAdded {
            job_id: child.id.clone(),
            name: child.name.clone(),
        });
        Ok(child)
    }

    fn index_put(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    fn index_get(&self, id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// Prefer the indexed record (it carries progress and logs) over the
    /// wire copy, but trust the wire attempt count.
    fn take_or_adopt(&self, message: JobMessage) -> Job {
        let attempts = message.attempts;
        let wire_job = message.into_job();
        match self.index_get(&wire_job.id) {
            Some(mut indexed) => {
                indexed.attempts_made = attempts;
                indexed
            }
            None => wire_job,
        }
    }

    /// Apply retention and keep the terminal job queryable in the index.
    fn settle_terminal(&self, job: &Job, state: JobState) {
        use crate::job::Retention;

        let retention = match state {
            JobState::Completed => job.opts.remove_on_complete,
            _ => job.opts.remove_on_fail,
        };

        let mut jobs = self.jobs.lock().unwrap();
        match retention {
            Retention::Remove => {
                jobs.remove(&job.id);
            }
            Retention::Keep => {
                jobs.insert(job.id.clone(), job.clone());
            }
            Retention::KeepLast(n) => {
                jobs.insert(job.id.clone(), job.clone());

                // Evict the oldest terminal records in this state beyond N
                let mut terminal: Vec<(String, chrono::DateTime<Utc>)> = jobs
                    .values()
                    .filter(|j| j.state == state)
                    .map(|j| (j.id.clone(), j.finished_on.unwrap_or(j.timestamp)))
                    .collect();
                if terminal.len() > n as usize {
                    terminal.sort_by_key(|(_, at)| *at);
                    let excess = terminal.len() - n as usize;
                    for (id, _) in terminal.into_iter().take(excess) {
                        jobs.remove(&id);
                    }
                }
            }
        }
    }

    fn counts(&self) -> JobCounts {
        let jobs = self.jobs.lock().unwrap();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.state {
                JobState::Waiting | JobState::Paused => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Stuck => counts.stuck += 1,
            }
        }
        counts
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Queue for BrokerQueue {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn broker(&self) -> BrokerKind {
        BrokerKind::RabbitMq
    }

    async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        self.inner.ensure_open()?;
        opts.validate()?;

        // The broker keeps no global index, so a colliding job id simply
        // overwrites the previous record.
        let mut job = Job::new(name, data, opts);

        if let Some(repeat) = job.opts.repeat.clone() {
            job.state = JobState::Delayed;
            self.inner.index_put(job.clone());

            let handle = tokio::spawn(BrokerQueue::repeat_loop(
                Arc::clone(&self.inner),
                job.clone(),
                repeat,
            ));
            self.inner.repeat_timers.lock().unwrap().push(handle);
        } else if job.state == JobState::Delayed {
            self.inner.index_put(job.clone());
            BrokerInner::schedule_publish(Arc::clone(&self.inner), job.clone(), job.delay);
        } else {
            self.inner.index_put(job.clone());
            self.inner.publish_job(&job).await?;
        }

        self.inner.events.publish(QueueEvent::JobAdded {
            job_id: job.id.clone(),
            name: job.name.clone(),
        });
        debug!(job_id = %job.id, name = %job.name, state = %job.state, "Added job");

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
        // Zero means "use the configured prefetch"
        let concurrency = if concurrency == 0 {
            self.inner.config.amqp.prefetch as usize
        } else {
            concurrency
        }
        .max(1);

        {
            let mut registered = self.inner.processors.lock().unwrap();
            if registered.contains_key(name) {
                return Err(QueueError::ProcessorExists(name.to_string()));
            }
            registered.insert(name.to_string(), concurrency);
        }

        let handle = tokio::spawn(BrokerQueue::consumer_supervisor(
            Arc::clone(&self.inner),
            name.to_string(),
            concurrency,
            processor,
        ));
        self.inner.consumers.lock().unwrap().push(handle);

        info!(
            queue = %self.inner.config.name,
            processor = %name,
            prefetch = concurrency,
            "Registered processor"
        );
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.index_get(id))
    }

    async fn get_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = {
            let index = self.inner.jobs.lock().unwrap();
            index
                .values()
                .filter(|job| states.contains(&job.state))
                .cloned()
                .collect()
        };
        jobs.sort_by_key(|job| job.timestamp);

        let end = end.min(jobs.len());
        let start = start.min(end);
        Ok(jobs[start..end].to_vec())
    }

    async fn get_job_counts(&self) -> Result<JobCounts, QueueError> {
        Ok(self.inner.counts())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.events.publish(QueueEvent::Paused);
        info!(queue = %self.inner.config.name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
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
        let cutoff = Utc::now() - chrono::Duration::milliseconds(grace_ms as i64);
        let budget = limit.unwrap_or(usize::MAX);

        let removed: Vec<String> = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let mut candidates: Vec<(String, chrono::DateTime<Utc>)> = jobs
                .values()
                .filter(|job| match state {
                    Some(s) => job.state == s && job.state.is_terminal(),
                    None => job.state.is_terminal(),
                })
                .filter(|job| job.finished_on.map(|at| at <= cutoff).unwrap_or(false))
                .map(|job| (job.id.clone(), job.finished_on.unwrap_or(job.timestamp)))
                .collect();

            candidates.sort_by_key(|(_, at)| *at);
            candidates
                .into_iter()
                .take(budget)
                .map(|(id, _)| {
                    jobs.remove(&id);
                    id
                })
                .collect()
        };

        self.inner
            .events
            .publish(QueueEvent::Cleaned { removed: removed.len() });
        info!(queue = %self.inner.config.name, count = removed.len(), "Cleaned terminal jobs");
        Ok(removed)
    }

    async fn empty(&self) -> Result<(), QueueError> {
        // Cancel every pending delayed publish and repeat schedule
        {
            let mut timers = self.inner.timers.lock().unwrap();
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        {
            let mut repeats = self.inner.repeat_timers.lock().unwrap();
            for handle in repeats.drain(..) {
                handle.abort();
            }
        }

        // Drop queued records from the index
        let discarded = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|_, job| !matches!(job.state, JobState::Waiting | JobState::Delayed));
            before - jobs.len()
        };

        // Purge the broker-side queues
        let names: Vec<String> = self.inner.processors.lock().unwrap().keys().cloned().collect();
        if !names.is_empty() {
            match self.inner.ensure_channel().await {
                Ok(channel) => {
                    for name in names {
                        if let Err(e) = channel
                            .queue_purge(
                                &self.inner.job_queue_name(&name),
                                QueuePurgeOptions::default(),
                            )
                            .await
                        {
                            warn!(queue = %self.inner.config.name, processor = %name, error = %e, "Failed to purge queue");
                        }
                    }
                }
                Err(e) => {
                    warn!(queue = %self.inner.config.name, error = %e, "No channel available to purge queues");
                }
            }
        }

        info!(queue = %self.inner.config.name, discarded, "Emptied queue");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.inner.shutdown_tx.send(true);

        {
            let mut consumers = self.inner.consumers.lock().unwrap();
            for handle in consumers.drain(..) {
                handle.abort();
            }
        }
        {
            let mut timers = self.inner.timers.lock().unwrap();
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        {
            let mut repeats = self.inner.repeat_timers.lock().unwrap();
            for handle in repeats.drain(..) {
                handle.abort();
            }
        }

        let mut state = self.inner.conn_state.lock().await;
        if let Some((connection, channel)) = state.take() {
            let _ = channel.close(200, "closing").await;
            let _ = connection.close(200, "closing").await;
        }

        info!(queue = %self.inner.config.name, "Broker queue closed");
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetricsSnapshot, QueueError> {
        let counts = self.inner.counts();
        let paused = self.is_paused();
        let snapshot = self.inner.tracker.lock().unwrap().snapshot(
            &self.inner.config.name,
            BrokerKind::RabbitMq,
            counts,
            paused,
        );
        Ok(snapshot)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    async fn update_job(&self, id: &str, data: serde_json::Value) -> Result<(), QueueError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.data = data;
        Ok(())
    }

    async fn job_progress(&self, id: &str, progress: JobProgress) -> Result<(), QueueError> {
        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            job.progress = progress.clone();
        }
        self.inner.events.publish(QueueEvent::JobProgress {
            job_id: id.to_string(),
            progress,
        });
        Ok(())
    }

    async fn job_log(&self, id: &str, message: &str) -> Result<(), QueueError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.logs.push(message.to_string());
        Ok(())
    }

    async fn remove_job(&self, id: &str) -> Result<(), QueueError> {
        if let Some(handle) = self.inner.timers.lock().unwrap().remove(id) {
            handle.abort();
        }
        let removed = self.inner.jobs.lock().unwrap().remove(id).is_some();
        if removed {
            self.inner
                .events
                .publish(QueueEvent::JobRemoved { job_id: id.to_string() });
        }
        // remove is idempotent
        Ok(())
    }

    async fn retry_job(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .index_get(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        if job.state != JobState::Failed {
            return Err(QueueError::Config(format!(
                "retry requires a failed job, '{}' is {}",
                id, job.state
            )));
        }

        // Explicit retry grants a fresh attempt budget
        job.attempts_made = 0;
        job.failed_reason = None;
        job.discarded = false;
        job.mark_waiting();
        self.inner.index_put(job.clone());
        self.inner.publish_job(&job).await?;

        info!(job_id = %id, "Re-published failed job");
        Ok(())
    }

    async fn discard_job(&self, id: &str) -> Result<(), QueueError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.discarded = true;
        Ok(())
    }

    async fn promote_job(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self
            .inner
            .index_get(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        if job.state != JobState::Delayed {
            return Err(QueueError::Config(format!(
                "promote requires a delayed job, '{}' is {}",
                id, job.state
            )));
        }

        if let Some(handle) = self.inner.timers.lock().unwrap().remove(id) {
            handle.abort();
        }

        job.mark_waiting();
        self.inner.index_put(job.clone());
        self.inner.publish_job(&job).await?;
        Ok(())
    }
}

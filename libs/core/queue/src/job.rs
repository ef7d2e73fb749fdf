//! Job model and options.
//!
//! This module provides:
//! - `Job` - the in-memory representation of a unit of deferred work
//! - `JobState` - lifecycle states
//! - `JobOptions` - concrete options record with builder methods
//! - `JobMessage` - the JSON wire body used by the broker backend

use crate::backoff::Backoff;
use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of priority buckets. Priorities are clamped to `0..PRIORITY_LEVELS`;
/// lower values dispatch first.
pub const PRIORITY_LEVELS: u8 = 10;

/// Lifecycle state of a job. Every job is in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be picked up by a worker.
    Waiting,
    /// Scheduled for a future run time.
    Delayed,
    /// Currently being processed.
    Active,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its attempts. Terminal (until an explicit retry).
    Failed,
    /// Held because the queue is paused.
    Paused,
    /// Abandoned mid-flight (worker died or drain timed out).
    Stuck,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Stuck => "stuck",
        }
    }

    /// Terminal states cannot transition further on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "stuck" => Ok(Self::Stuck),
            other => Err(QueueError::Internal(format!("unknown job state '{}'", other))),
        }
    }
}

/// Retention policy for terminal jobs.
///
/// Serializes to the compact wire form: `false` keeps forever, `true`
/// removes immediately, a number keeps the last N.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep the job record indefinitely.
    Keep,
    /// Delete the record as soon as the job reaches a terminal state.
    Remove,
    /// Keep only the most recent N terminal records.
    KeepLast(u32),
}

impl Default for Retention {
    fn default() -> Self {
        Self::Keep
    }
}

impl Serialize for Retention {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Keep => serializer.serialize_bool(false),
            Self::Remove => serializer.serialize_bool(true),
            Self::KeepLast(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Retention {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Count(u32),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Self::Remove,
            Raw::Flag(false) | Raw::Count(0) => Self::Keep,
            Raw::Count(n) => Self::KeepLast(n),
        })
    }
}

/// Repeat schedule for recurring jobs.
///
/// `every` (an interval in milliseconds) is the supported form; `cron` is
/// carried for compatibility but rejected by both backends.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Interval between ticks, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    /// Maximum number of child jobs to spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Run one child immediately before waiting for the first tick.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub immediately: bool,
}

impl Repeat {
    pub fn every(interval_ms: u64) -> Self {
        Self {
            every: Some(interval_ms),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn immediately(mut self) -> Self {
        self.immediately = true;
        self
    }
}

/// Options attached to a job at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Delay in milliseconds before the job becomes runnable.
    pub delay: u64,

    /// Priority bucket; lower values dispatch first.
    pub priority: u8,

    /// Maximum total attempts (at least 1).
    pub attempts: u32,

    /// Retry backoff policy.
    pub backoff: Backoff,

    /// Maximum processor runtime in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    pub remove_on_complete: Retention,

    pub remove_on_fail: Retention,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Repeat>,

    /// Caller-supplied idempotency key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            priority: 0,
            attempts: 1,
            backoff: Backoff::default(),
            timeout: None,
            remove_on_complete: Retention::Keep,
            remove_on_fail: Retention::Keep,
            repeat: None,
            job_id: None,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(PRIORITY_LEVELS - 1);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = retention;
        self
    }

    pub fn with_remove_on_fail(mut self, retention: Retention) -> Self {
        self.remove_on_fail = retention;
        self
    }

    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate the options before accepting a job.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.attempts == 0 {
            return Err(QueueError::InvalidBackoff(
                "attempts must be at least 1".to_string(),
            ));
        }
        self.backoff.validate()?;
        if let Some(repeat) = &self.repeat {
            if repeat.cron.is_some() {
                return Err(QueueError::NotSupported(
                    "cron repeat expressions".to_string(),
                ));
            }
            if repeat.every.is_none() {
                return Err(QueueError::InvalidInterval(
                    "repeat requires an interval".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Job progress: a percentage or an arbitrary JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(u8),
    Data(serde_json::Value),
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::Percent(0)
    }
}

impl JobProgress {
    /// Percentage view of the progress, 0 when the progress is a document.
    pub fn as_percent(&self) -> u8 {
        match self {
            Self::Percent(p) => (*p).min(100),
            Self::Data(_) => 0,
        }
    }
}

/// A unit of deferred work owned by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque identifier, caller-overridable via `JobOptions::job_id`.
    pub id: String,

    /// Processor key this job is routed to.
    pub name: String,

    /// Opaque payload.
    pub data: serde_json::Value,

    pub opts: JobOptions,

    /// Attempts consumed so far; never exceeds `opts.attempts`.
    pub attempts_made: u32,

    pub state: JobState,

    #[serde(default)]
    pub progress: JobProgress,

    /// Creation time.
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<DateTime<Utc>>,

    /// Effective delay in milliseconds (copied from opts at creation).
    #[serde(default)]
    pub delay: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,

    /// Free-form log lines appended via `job_log`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,

    /// Set by `discard_job`; suppresses further retries.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discarded: bool,
}

impl Job {
    /// Create a new job. The initial state is `Waiting`, or `Delayed` when
    /// the options carry a positive delay.
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> Self {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let state = if opts.delay > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let delay = opts.delay;

        Self {
            id,
            name: name.into(),
            data,
            opts,
            attempts_made: 0,
            state,
            progress: JobProgress::default(),
            timestamp: Utc::now(),
            processed_on: None,
            finished_on: None,
            delay,
            failed_reason: None,
            stacktrace: Vec::new(),
            return_value: None,
            logs: Vec::new(),
            discarded: false,
        }
    }

    /// The absolute earliest time this job may first run.
    pub fn earliest_run_at(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::milliseconds(self.delay as i64)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a failure at this point leaves attempts in budget.
    pub fn can_retry(&self) -> bool {
        !self.discarded && self.attempts_made < self.opts.attempts
    }

    /// Transition to `Active` and stamp `processed_on`.
    pub fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.processed_on = Some(Utc::now());
    }

    /// Terminal success: stamp `finished_on` and record the return value.
    pub fn mark_completed(&mut self, return_value: serde_json::Value) {
        self.state = JobState::Completed;
        self.finished_on = Some(Utc::now());
        self.return_value = Some(return_value);
        self.progress = JobProgress::Percent(100);
    }

    /// Terminal failure: stamp `finished_on` and record the reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state = JobState::Failed;
        self.finished_on = Some(Utc::now());
        self.stacktrace.push(reason.clone());
        self.failed_reason = Some(reason);
    }

    /// Re-enter the waiting state after a retryable failure or a stall.
    pub fn mark_waiting(&mut self) {
        self.state = JobState::Waiting;
        self.processed_on = None;
        self.finished_on = None;
    }

    /// Spawn a child job from a repeat template, with its own id and clock.
    pub fn repeat_child(&self) -> Self {
        let mut opts = self.opts.clone();
        opts.repeat = None;
        opts.job_id = None;
        opts.delay = 0;
        let mut child = Self::new(self.name.clone(), self.data.clone(), opts);
        child.delay = 0;
        child
    }
}

/// JSON wire body published to the broker.
///
/// `attempts` carries the attempts made so far so that re-published retries
/// keep their history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub attempts: u32,
    /// Creation time as epoch milliseconds.
    pub timestamp: i64,
    pub progress: u8,
    pub state: JobState,
    /// Producer tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_enabled: Option<bool>,
}

impl JobMessage {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            data: job.data.clone(),
            opts: job.opts.clone(),
            attempts: job.attempts_made,
            timestamp: job.timestamp.timestamp_millis(),
            progress: job.progress.as_percent(),
            state: job.state,
            source: None,
            integrity_enabled: None,
        }
    }

    pub fn into_job(self) -> Job {
        let timestamp = DateTime::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now);
        let delay = self.opts.delay;
        Job {
            id: self.id,
            name: self.name,
            data: self.data,
            opts: self.opts,
            attempts_made: self.attempts,
            state: self.state,
            progress: JobProgress::Percent(self.progress),
            timestamp,
            processed_on: None,
            finished_on: None,
            delay,
            failed_reason: None,
            stacktrace: Vec::new(),
            return_value: None,
            logs: Vec::new(),
            discarded: false,
        }
    }
}

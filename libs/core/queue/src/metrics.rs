//! Metrics for queue observability.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! queue throughput and health, plus the per-queue `QueueMetricsSnapshot`
//! served by the admin surface.
//!
//! ## Available Metrics
//!
//! - `queue_jobs_processed_total` - Counter of jobs processed by status
//! - `queue_job_duration_seconds` - Histogram of processing time
//! - `queue_depth` - Gauge of jobs per state
//! - `queue_errors_total` - Counter of errors by category
//! - `queue_retries_total` - Counter of retry attempts

use crate::config::BrokerKind;
use crate::queue::JobCounts;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_PROCESSED: &str = "queue_jobs_processed_total";
    pub const JOB_DURATION: &str = "queue_job_duration_seconds";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const ERRORS: &str = "queue_errors_total";
    pub const RETRIES: &str = "queue_retries_total";
}

/// Job outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Completed,
    Failed,
    Retried,
    Stalled,
    Cancelled,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retried => "retried",
            Self::Stalled => "stalled",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle.
///
/// Returns None if metrics haven't been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a job outcome.
pub fn record_job_processed(queue: &str, broker: BrokerKind, outcome: JobOutcome) {
    counter!(
        names::JOBS_PROCESSED,
        "queue" => queue.to_string(),
        "broker" => broker.as_str(),
        "status" => outcome.as_str()
    )
    .increment(1);
}

/// Record job processing duration.
pub fn record_job_duration(queue: &str, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the per-state depth gauge.
pub fn set_queue_depth(queue: &str, state: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "queue" => queue.to_string(),
        "state" => state.to_string()
    )
    .set(depth);
}

/// Record an error by category.
pub fn record_error(queue: &str, category: &str) {
    counter!(
        names::ERRORS,
        "queue" => queue.to_string(),
        "category" => category.to_string()
    )
    .increment(1);
}

/// Record a retry attempt.
pub fn record_retry(queue: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Per-queue metrics snapshot served by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub name: String,
    pub broker: BrokerKind,
    pub counts: JobCounts,
    /// Smoothed jobs/minute over the configured window.
    pub processing_rate: f64,
    /// Smoothed failures/minute over the configured window.
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub min_processing_ms: Option<u64>,
    pub max_processing_ms: Option<u64>,
    pub paused: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub errors_last_24h: u64,
}

/// Rolling per-queue throughput tracker behind each backend.
///
/// Keeps event timestamps for the EWMA window and the 24-hour error count,
/// and running processing-time statistics.
#[derive(Debug)]
pub struct ThroughputTracker {
    window: Duration,
    processed: VecDeque<DateTime<Utc>>,
    errors: VecDeque<DateTime<Utc>>,
    /// Previous smoothed rates, carried between snapshots.
    smoothed_processing_rate: f64,
    smoothed_error_rate: f64,
    total_duration_ms: u64,
    duration_samples: u64,
    min_ms: Option<u64>,
    max_ms: Option<u64>,
    last_activity: Option<DateTime<Utc>>,
}

/// Smoothing factor: how much the latest window counts against history.
const EWMA_ALPHA: f64 = 0.3;

/// Upper bound on retained event timestamps.
const MAX_TRACKED_EVENTS: usize = 10_000;

impl ThroughputTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            processed: VecDeque::new(),
            errors: VecDeque::new(),
            smoothed_processing_rate: 0.0,
            smoothed_error_rate: 0.0,
            total_duration_ms: 0,
            duration_samples: 0,
            min_ms: None,
            max_ms: None,
            last_activity: None,
        }
    }

    pub fn record_processed(&mut self, duration_ms: u64) {
        let now = Utc::now();
        push_capped(&mut self.processed, now);
        self.last_activity = Some(now);

        self.total_duration_ms += duration_ms;
        self.duration_samples += 1;
        self.min_ms = Some(self.min_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_ms = Some(self.max_ms.map_or(duration_ms, |m| m.max(duration_ms)));
    }

    pub fn record_error(&mut self) {
        let now = Utc::now();
        push_capped(&mut self.errors, now);
        self.last_activity = Some(now);
    }

    /// Count of errors in the trailing 24 hours.
    pub fn errors_last_24h(&mut self) -> u64 {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        while let Some(front) = self.errors.front() {
            if *front < cutoff {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.len() as u64
    }

    /// Smoothed processing and error rates, in events per minute.
    pub fn rates(&mut self) -> (f64, f64) {
        let window_secs = self.window.as_secs_f64().max(1.0);
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.window.as_millis() as i64);

        let in_window = |events: &VecDeque<DateTime<Utc>>| {
            events.iter().rev().take_while(|t| **t >= cutoff).count() as f64
        };

        let processing = in_window(&self.processed) / window_secs * 60.0;
        let errors = in_window(&self.errors) / window_secs * 60.0;

        self.smoothed_processing_rate =
            EWMA_ALPHA * processing + (1.0 - EWMA_ALPHA) * self.smoothed_processing_rate;
        self.smoothed_error_rate =
            EWMA_ALPHA * errors + (1.0 - EWMA_ALPHA) * self.smoothed_error_rate;

        (self.smoothed_processing_rate, self.smoothed_error_rate)
    }

    pub fn avg_processing_ms(&self) -> f64 {
        if self.duration_samples == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.duration_samples as f64
        }
    }

    pub fn min_processing_ms(&self) -> Option<u64> {
        self.min_ms
    }

    pub fn max_processing_ms(&self) -> Option<u64> {
        self.max_ms
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    /// Build a snapshot for the given queue identity and counts.
    pub fn snapshot(
        &mut self,
        name: &str,
        broker: BrokerKind,
        counts: JobCounts,
        paused: bool,
    ) -> QueueMetricsSnapshot {
        let (processing_rate, error_rate) = self.rates();
        QueueMetricsSnapshot {
            name: name.to_string(),
            broker,
            counts,
            processing_rate,
            error_rate,
            avg_processing_ms: self.avg_processing_ms(),
            min_processing_ms: self.min_processing_ms(),
            max_processing_ms: self.max_processing_ms(),
            paused,
            last_activity: self.last_activity(),
            errors_last_24h: self.errors_last_24h(),
        }
    }
}

fn push_capped(events: &mut VecDeque<DateTime<Utc>>, at: DateTime<Utc>) {
    if events.len() >= MAX_TRACKED_EVENTS {
        events.pop_front();
    }
    events.push_back(at);
}

/// Helper struct for timing operations and recording metrics.
pub struct MetricsTimer {
    queue: String,
    start: std::time::Instant,
    recorded: bool,
}

impl MetricsTimer {
    /// Start a new timer for the given queue.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            start: std::time::Instant::now(),
            recorded: false,
        }
    }

    /// Get elapsed time without stopping.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and record the duration.
    pub fn stop(mut self) {
        self.recorded = true;
        record_job_duration(&self.queue, self.start.elapsed());
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        // Auto-record on drop if not manually stopped
        if !self.recorded {
            record_job_duration(&self.queue, self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_outcome_as_str() {
        assert_eq!(JobOutcome::Completed.as_str(), "completed");
        assert_eq!(JobOutcome::Failed.as_str(), "failed");
        assert_eq!(JobOutcome::Retried.as_str(), "retried");
        assert_eq!(JobOutcome::Stalled.as_str(), "stalled");
        assert_eq!(JobOutcome::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_tracker_duration_stats() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
        tracker.record_processed(100);
        tracker.record_processed(300);
        tracker.record_processed(200);

        assert_eq!(tracker.avg_processing_ms(), 200.0);
        assert_eq!(tracker.min_processing_ms(), Some(100));
        assert_eq!(tracker.max_processing_ms(), Some(300));
        assert!(tracker.last_activity().is_some());
    }

    #[test]
    fn test_tracker_rates_reflect_activity() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
        for _ in 0..30 {
            tracker.record_processed(10);
        }
        tracker.record_error();

        let (processing, errors) = tracker.rates();
        assert!(processing > 0.0);
        assert!(errors > 0.0);
        assert!(processing > errors);
    }

    #[test]
    fn test_tracker_idle_rates_decay_toward_zero() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
        tracker.record_processed(10);

        let (first, _) = tracker.rates();
        let mut last = first;
        for _ in 0..20 {
            let (rate, _) = tracker.rates();
            last = rate;
        }
        // Repeated sampling of the same single event keeps the rate bounded
        assert!(last <= first * 4.0 + 1.0);
    }

    #[test]
    fn test_errors_last_24h_prunes_old_entries() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
        tracker.record_error();
        tracker.record_error();
        assert_eq!(tracker.errors_last_24h(), 2);

        // Forcibly age one entry past the cutoff
        if let Some(front) = tracker.errors.front_mut() {
            *front = Utc::now() - chrono::Duration::hours(25);
        }
        assert_eq!(tracker.errors_last_24h(), 1);
    }

    #[test]
    fn test_snapshot_shape() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(60));
        tracker.record_processed(50);

        let snapshot = tracker.snapshot("mail", BrokerKind::Redis, JobCounts::default(), false);
        assert_eq!(snapshot.name, "mail");
        assert_eq!(snapshot.broker, BrokerKind::Redis);
        assert!(!snapshot.paused);
        assert_eq!(snapshot.avg_processing_ms, 50.0);
    }

    #[test]
    fn test_metrics_timer_elapsed() {
        let timer = MetricsTimer::new("test_queue");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed().as_millis() >= 10);
    }
}

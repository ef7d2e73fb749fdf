//! Aggregated monitoring and bulk admin operations over the factory.
//!
//! `QueueMonitor` is the backing implementation for the admin API: the
//! dashboard rollup, health status, per-queue job listings, bulk retry and
//! clean, and the periodic metrics sampler.

use crate::config::{BrokerKind, MonitoringSettings};
use crate::error::QueueError;
use crate::factory::QueueFactory;
use crate::job::{Job, JobState};
use crate::metrics::{self, QueueMetricsSnapshot};
use crate::queue::Queue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health rollup across all queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Aggregated dashboard summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_queues: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub status: HealthStatus,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing_rate: f64,
    pub error_rate: f64,
    pub queues: Vec<QueueMetricsSnapshot>,
}

/// Result of a bulk retry over a queue's failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub retried: Vec<String>,
    pub errors: Vec<RetryError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryError {
    pub job_id: String,
    pub error: String,
}

/// Monitoring and bulk admin surface over a queue factory.
pub struct QueueMonitor {
    factory: Arc<QueueFactory>,
    settings: MonitoringSettings,
}

impl QueueMonitor {
    pub fn new(factory: Arc<QueueFactory>, settings: MonitoringSettings) -> Self {
        Self { factory, settings }
    }

    pub fn factory(&self) -> &Arc<QueueFactory> {
        &self.factory
    }

    async fn queue_or_not_found(
        &self,
        broker: BrokerKind,
        name: &str,
    ) -> Result<Arc<dyn Queue>, QueueError> {
        self.factory
            .get(broker, name)
            .await
            .ok_or_else(|| QueueError::QueueNotFound(format!("{}/{}", broker, name)))
    }

    /// Collect metrics from every queue; queues that error are reported as
    /// down rather than failing the whole call.
    async fn collect(&self) -> (Vec<QueueMetricsSnapshot>, usize) {
        let mut snapshots = Vec::new();
        let mut down = 0;

        for queue in self.factory.all().await {
            match queue.metrics().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(queue = %queue.name(), error = %e, "Failed to collect queue metrics");
                    down += 1;
                }
            }
        }
        (snapshots, down)
    }

    fn queue_is_healthy(snapshot: &QueueMetricsSnapshot) -> bool {
        snapshot.error_rate < f64::EPSILON
    }

    /// Health rollup: degraded when any queue shows sustained errors or is
    /// unreachable; unhealthy when the majority are down.
    pub async fn health(&self) -> HealthStatus {
        let total = self.factory.len().await;
        if total == 0 {
            return HealthStatus::Healthy;
        }

        let (snapshots, down) = self.collect().await;
        let erroring = snapshots.iter().filter(|s| !Self::queue_is_healthy(s)).count();

        if down * 2 > total {
            HealthStatus::Unhealthy
        } else if down > 0 || erroring > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Aggregated dashboard across all queues.
    pub async fn dashboard(&self) -> DashboardSummary {
        let total = self.factory.len().await;
        let (snapshots, down) = self.collect().await;

        let mut summary = DashboardSummary {
            total_queues: total,
            healthy: 0,
            unhealthy: down,
            status: HealthStatus::Healthy,
            waiting: 0,
            delayed: 0,
            active: 0,
            completed: 0,
            failed: 0,
            processing_rate: 0.0,
            error_rate: 0.0,
            queues: Vec::new(),
        };

        for snapshot in &snapshots {
            if Self::queue_is_healthy(snapshot) {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            summary.waiting += snapshot.counts.waiting;
            summary.delayed += snapshot.counts.delayed;
            summary.active += snapshot.counts.active;
            summary.completed += snapshot.counts.completed;
            summary.failed += snapshot.counts.failed;
            summary.processing_rate += snapshot.processing_rate;
            summary.error_rate += snapshot.error_rate;
        }

        summary.status = if total > 0 && down * 2 > total {
            HealthStatus::Unhealthy
        } else if summary.unhealthy > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        summary.queues = snapshots;
        summary
    }

    /// Metrics for one queue.
    pub async fn queue_metrics(
        &self,
        broker: BrokerKind,
        name: &str,
    ) -> Result<QueueMetricsSnapshot, QueueError> {
        let queue = self.queue_or_not_found(broker, name).await?;
        queue.metrics().await
    }

    /// Job listing for one queue.
    pub async fn queue_jobs(
        &self,
        broker: BrokerKind,
        name: &str,
        states: &[JobState],
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let queue = self.queue_or_not_found(broker, name).await?;
        queue.get_jobs(states, 0, limit).await
    }

    /// Retry every failed job on a queue, collecting per-item errors.
    pub async fn retry_failed(
        &self,
        broker: BrokerKind,
        name: &str,
        limit: Option<usize>,
    ) -> Result<RetryReport, QueueError> {
        let queue = self.queue_or_not_found(broker, name).await?;
        let failed = queue
            .get_jobs(&[JobState::Failed], 0, limit.unwrap_or(usize::MAX))
            .await?;

        let mut report = RetryReport {
            retried: Vec::new(),
            errors: Vec::new(),
        };

        for job in failed {
            match queue.retry_job(&job.id).await {
                Ok(()) => report.retried.push(job.id),
                Err(e) => report.errors.push(RetryError {
                    job_id: job.id,
                    error: e.to_string(),
                }),
            }
        }

        info!(
            broker = %broker,
            queue = %name,
            retried = report.retried.len(),
            errors = report.errors.len(),
            "Bulk retry finished"
        );
        Ok(report)
    }

    /// Clean terminal jobs older than the grace period; returns the count.
    pub async fn clean_jobs(
        &self,
        broker: BrokerKind,
        name: &str,
        grace_ms: u64,
        state: Option<JobState>,
    ) -> Result<usize, QueueError> {
        let queue = self.queue_or_not_found(broker, name).await?;
        let removed = queue.clean(grace_ms, state, None).await?;
        Ok(removed.len())
    }

    pub async fn pause(&self, broker: BrokerKind, name: &str) -> Result<(), QueueError> {
        self.queue_or_not_found(broker, name).await?.pause().await
    }

    pub async fn resume(&self, broker: BrokerKind, name: &str) -> Result<(), QueueError> {
        self.queue_or_not_found(broker, name).await?.resume().await
    }

    /// Prometheus text exposition of the process metrics.
    pub fn prometheus(&self) -> Option<String> {
        metrics::get_metrics_handle().map(|handle| handle.render())
    }

    /// Periodic sampler: publishes depth gauges for every queue until
    /// shutdown. Spawn this once per process.
    pub async fn run_sampler(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.settings.enabled {
            debug!("Queue monitoring sampler disabled");
            return;
        }

        let interval = Duration::from_millis(self.settings.interval_ms.max(1_000));
        info!(interval_ms = interval.as_millis() as u64, "Queue metrics sampler started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let (snapshots, _) = self.collect().await;
                    for snapshot in snapshots {
                        metrics::set_queue_depth(&snapshot.name, "waiting", snapshot.counts.waiting as f64);
                        metrics::set_queue_depth(&snapshot.name, "delayed", snapshot.counts.delayed as f64);
                        metrics::set_queue_depth(&snapshot.name, "active", snapshot.counts.active as f64);
                        metrics::set_queue_depth(&snapshot.name, "failed", snapshot.counts.failed as f64);
                    }
                }
            }
        }

        info!("Queue metrics sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn monitor_with(factory: Arc<QueueFactory>) -> QueueMonitor {
        QueueMonitor::new(factory, MonitoringSettings::default())
    }

    #[tokio::test]
    async fn test_health_with_no_queues_is_healthy() {
        let monitor = monitor_with(Arc::new(QueueFactory::new()));
        assert_eq!(monitor.health().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_dashboard_aggregates_queues() {
        let factory = Arc::new(QueueFactory::new());
        factory
            .create(QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();
        factory
            .create(QueueConfig::new("audit").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();

        let monitor = monitor_with(factory);
        let dashboard = monitor.dashboard().await;

        assert_eq!(dashboard.total_queues, 2);
        assert_eq!(dashboard.queues.len(), 2);
        assert_eq!(dashboard.status, HealthStatus::Healthy);
        assert_eq!(dashboard.healthy, 2);
        assert_eq!(dashboard.failed, 0);
    }

    #[tokio::test]
    async fn test_queue_metrics_unknown_queue_errors() {
        let monitor = monitor_with(Arc::new(QueueFactory::new()));
        let result = monitor.queue_metrics(BrokerKind::Redis, "nope").await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_failed_on_empty_queue() {
        let factory = Arc::new(QueueFactory::new());
        factory
            .create(QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();

        let monitor = monitor_with(factory);
        let report = monitor
            .retry_failed(BrokerKind::RabbitMq, "mail", None)
            .await
            .unwrap();
        assert!(report.retried.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_health_status_as_str() {
        assert_eq!(HealthStatus::Healthy.as_str(), "healthy");
        assert_eq!(HealthStatus::Degraded.as_str(), "degraded");
        assert_eq!(HealthStatus::Unhealthy.as_str(), "unhealthy");
    }
}

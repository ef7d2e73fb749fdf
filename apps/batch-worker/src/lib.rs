//! Batch worker service wiring.
//!
//! Builds the queue from environment configuration, starts the batch
//! worker, the metrics sampler and the admin HTTP server, and ties them
//! all to one shutdown channel driven by SIGINT/SIGTERM.

use async_trait::async_trait;
use core_config::{Environment, FromEnv, env_or_default, server::ServerConfig};
use domain_audit::{AuditConfig, AuditRecord, BrokerAuditSink, FallbackAuditor, MemoryAuditSink};
use domain_notifications::{
    BatchWorker, BatchWorkerConfig, InMemoryRepository, Notification, NotificationResult,
    NotificationSender, SystemClock,
};
use job_queue::{MonitoringSettings, QueueConfig, QueueFactory, QueueMonitor, admin_router};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Delivery port wired to logging only.
///
/// Real deployments plug in their provider stack here; the worker only
/// sees the `NotificationSender` port.
struct LoggingSender;

#[async_trait]
impl NotificationSender for LoggingSender {
    async fn send(&self, notification: &Notification) -> NotificationResult<()> {
        info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            subject = %notification.subject,
            "Delivering notification"
        );
        Ok(())
    }
}

/// Run the batch worker service until SIGINT/SIGTERM.
pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    job_queue::init_metrics();

    // The batch worker owns its own queue, separate from application queues
    let queue_name = env_or_default("BATCH_QUEUE_NAME", "notification-batches");
    let queue_config = QueueConfig::from_env(&queue_name).map_err(|e| eyre::eyre!(e))?;

    let factory = QueueFactory::global();
    let queue = factory
        .create(queue_config.clone())
        .await
        .map_err(|e| eyre::eyre!(e))?;

    let repository = Arc::new(InMemoryRepository::new());
    let worker = BatchWorker::new(
        queue,
        repository,
        Arc::new(LoggingSender),
        Arc::new(SystemClock),
        BatchWorkerConfig::from_env(),
    );
    worker.start().await.map_err(|e| eyre::eyre!(e))?;

    // Audit pipeline: broker primary, in-process fallback
    let auditor = Arc::new(FallbackAuditor::new(
        Arc::new(BrokerAuditSink::new(
            AuditConfig::from_env(),
            queue_config.amqp.clone(),
        )),
        Arc::new(MemoryAuditSink::new()),
    ));
    if let Err(e) = auditor
        .process(&AuditRecord::new(
            "batch_worker.started",
            serde_json::json!({ "queue": queue_name }),
        ))
        .await
    {
        warn!(error = %e, "Startup audit record could not be written");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic metrics sampler
    let monitor = Arc::new(QueueMonitor::new(
        Arc::clone(&factory),
        MonitoringSettings::from_env(),
    ));
    let sampler = {
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            monitor.run_sampler(shutdown).await;
        })
    };

    // Admin HTTP server
    let server_config = ServerConfig::from_env()?;
    let listener = tokio::net::TcpListener::bind(server_config.address()).await?;
    info!(address = %server_config.address(), "Admin API listening");

    let server = {
        let mut shutdown = shutdown_rx.clone();
        async move {
            axum::serve(listener, admin_router(monitor))
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "Admin server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sampler.await;

    if let Err(e) = factory.close_all().await {
        warn!(error = %e, "Error while closing queues");
    }

    info!("Batch worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

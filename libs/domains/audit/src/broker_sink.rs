//! Primary audit sink publishing to the AMQP broker.
//!
//! Connects lazily with a configurable timeout, publishes persistent JSON
//! messages with `message_id = uuid`, and annotates each record with the
//! producer `source` and `integrity_enabled` flags.

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditConfig, AuditRecord, AuditStats};
use crate::sink::AuditSink;
use async_trait::async_trait;
use job_queue::AmqpSettings;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broker-backed audit sink.
pub struct BrokerAuditSink {
    config: AuditConfig,
    amqp: AmqpSettings,
    state: tokio::sync::Mutex<Option<(Connection, Channel)>>,
    processed: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl BrokerAuditSink {
    pub fn new(config: AuditConfig, amqp: AmqpSettings) -> Self {
        Self {
            config,
            amqp,
            state: tokio::sync::Mutex::new(None),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn record_error(&self, error: &AuditError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    /// Get a usable channel, connecting on demand.
    async fn ensure_channel(&self) -> AuditResult<Channel> {
        let mut state = self.state.lock().await;

        if let Some((connection, channel)) = state.as_ref() {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        debug!(queue = %self.config.queue, "Connecting audit sink to broker");
        let amqp_url = self.amqp.url();
        let connect = Connection::connect(&amqp_url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_millis(self.amqp.connection_timeout_ms),
            connect,
        )
        .await
        .map_err(|_| AuditError::Connection("audit broker connect timed out".to_string()))??;

        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.config.queue, "Audit broker sink connected");
        *state = Some((connection, channel.clone()));
        Ok(channel)
    }

    async fn publish(&self, record: &AuditRecord) -> AuditResult<()> {
        let channel = self.ensure_channel().await?;

        let mut annotated = record.clone();
        annotated.source = Some(self.config.source.clone());
        annotated.integrity_enabled = Some(self.config.integrity_enabled);

        let body = serde_json::to_vec(&annotated)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_message_id(annotated.id.to_string().into())
            .with_content_type("application/json".into());

        channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        debug!(record_id = %record.id, action = %record.action, "Published audit record");
        Ok(())
    }

    async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = None;
    }
}

#[async_trait]
impl AuditSink for BrokerAuditSink {
    async fn process(&self, record: &AuditRecord) -> AuditResult<()> {
        let mut last = None;

        for attempt in 1..=self.config.max_retries {
            match self.publish(record).await {
                Ok(()) => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Audit publish failed"
                    );
                    self.invalidate().await;
                    last = Some(e);
                }
            }
        }

        let error = last.unwrap_or_else(|| AuditError::Sink("publish failed".to_string()));
        self.record_error(&error);
        Err(error)
    }

    async fn health(&self) -> bool {
        self.ensure_channel().await.is_ok()
    }

    fn stats(&self) -> AuditStats {
        AuditStats::from_counters(
            self.processed.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
            self.last_error.lock().unwrap().clone(),
        )
    }

    fn name(&self) -> &'static str {
        "broker"
    }
}

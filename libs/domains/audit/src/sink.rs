//! Audit sink trait and the direct in-process sink.

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditRecord, AuditStats};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record.
    async fn process(&self, record: &AuditRecord) -> AuditResult<()>;

    /// Whether the sink can currently accept records.
    async fn health(&self) -> bool;

    /// Counters for the admin layer.
    fn stats(&self) -> AuditStats;

    /// Sink name for logging.
    fn name(&self) -> &'static str;
}

/// Direct sink holding records in memory.
///
/// The default fallback for local runs and tests; production deployments
/// swap in a store-backed implementation of [`AuditSink`].
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    processed: AtomicU64,
    errors: AtomicU64,
    /// Test hook: refuse everything when set.
    fail: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `process` call fail (for exercising fallback paths).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn process(&self, record: &AuditRecord) -> AuditResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            return Err(AuditError::Sink("memory sink rejecting".to_string()));
        }

        self.records.lock().unwrap().push(record.clone());
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    fn stats(&self) -> AuditStats {
        AuditStats::from_counters(
            self.processed.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
            None,
        )
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_stores_records() {
        let sink = MemoryAuditSink::new();
        assert!(sink.is_empty());
        assert!(sink.health().await);

        sink.process(&AuditRecord::new("a", json!({}))).await.unwrap();
        sink.process(&AuditRecord::new("b", json!({}))).await.unwrap();

        assert_eq!(sink.len(), 2);
        let stats = sink.stats();
        assert_eq!(stats.processed_count, 2);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_memory_sink_failing_mode() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);

        assert!(!sink.health().await);
        let result = sink.process(&AuditRecord::new("a", json!({}))).await;
        assert!(result.is_err());
        assert_eq!(sink.stats().error_count, 1);
    }
}

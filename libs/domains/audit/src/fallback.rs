//! Primary/secondary composition of audit sinks.

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditRecord, AuditStats};
use crate::sink::AuditSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which sink is currently serving writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveSink {
    Primary,
    Fallback,
    None,
}

/// Health rollup of the audit pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHealth {
    pub healthy: bool,
    pub active: ActiveSink,
}

/// Combined statistics of both sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackStats {
    pub primary: AuditStats,
    pub fallback: AuditStats,
}

/// Audit pipeline with a primary sink and a direct fallback.
///
/// `process` never errors while the fallback succeeds; when both sinks
/// fail the error is reported to the caller and the record is NOT retried
/// silently.
pub struct FallbackAuditor {
    primary: Arc<dyn AuditSink>,
    fallback: Arc<dyn AuditSink>,
}

impl FallbackAuditor {
    pub fn new(primary: Arc<dyn AuditSink>, fallback: Arc<dyn AuditSink>) -> Self {
        Self { primary, fallback }
    }

    /// Write one record, falling back on primary failure.
    pub async fn process(&self, record: &AuditRecord) -> AuditResult<()> {
        let primary_error = match self.primary.process(record).await {
            Ok(()) => {
                debug!(record_id = %record.id, sink = self.primary.name(), "Audit record written");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(
            record_id = %record.id,
            sink = self.primary.name(),
            error = %primary_error,
            "Primary audit sink failed, using fallback"
        );

        match self.fallback.process(record).await {
            Ok(()) => {
                debug!(record_id = %record.id, sink = self.fallback.name(), "Audit record written via fallback");
                Ok(())
            }
            Err(fallback_error) => Err(AuditError::FallbackExhausted {
                primary: primary_error.to_string(),
                fallback: fallback_error.to_string(),
            }),
        }
    }

    /// Primary health, falling back to secondary health when the primary is
    /// down.
    pub async fn health(&self) -> AuditHealth {
        if self.primary.health().await {
            return AuditHealth {
                healthy: true,
                active: ActiveSink::Primary,
            };
        }
        if self.fallback.health().await {
            return AuditHealth {
                healthy: true,
                active: ActiveSink::Fallback,
            };
        }
        AuditHealth {
            healthy: false,
            active: ActiveSink::None,
        }
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            primary: self.primary.stats(),
            fallback: self.fallback.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryAuditSink;
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord::new("user.login", json!({ "ip": "10.0.0.1" }))
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = Arc::new(MemoryAuditSink::new());
        let fallback = Arc::new(MemoryAuditSink::new());
        let auditor = FallbackAuditor::new(primary.clone(), fallback.clone());

        auditor.process(&record()).await.unwrap();

        assert_eq!(primary.len(), 1);
        assert!(fallback.is_empty());

        let health = auditor.health().await;
        assert!(health.healthy);
        assert_eq!(health.active, ActiveSink::Primary);
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let primary = Arc::new(MemoryAuditSink::new());
        primary.set_failing(true);
        let fallback = Arc::new(MemoryAuditSink::new());
        let auditor = FallbackAuditor::new(primary.clone(), fallback.clone());

        auditor.process(&record()).await.unwrap();

        assert!(primary.records().is_empty());
        assert_eq!(fallback.len(), 1);
        assert_eq!(auditor.stats().primary.error_count, 1);

        let health = auditor.health().await;
        assert!(health.healthy);
        assert_eq!(health.active, ActiveSink::Fallback);
    }

    #[tokio::test]
    async fn test_both_failing_surfaces_error_once() {
        let primary = Arc::new(MemoryAuditSink::new());
        primary.set_failing(true);
        let fallback = Arc::new(MemoryAuditSink::new());
        fallback.set_failing(true);
        let auditor = FallbackAuditor::new(primary.clone(), fallback.clone());

        let result = auditor.process(&record()).await;
        assert!(matches!(result, Err(AuditError::FallbackExhausted { .. })));

        // One failed attempt each; nothing was silently retried
        assert_eq!(auditor.stats().primary.error_count, 1);
        assert_eq!(auditor.stats().fallback.error_count, 1);

        let health = auditor.health().await;
        assert!(!health.healthy);
        assert_eq!(health.active, ActiveSink::None);
    }
}

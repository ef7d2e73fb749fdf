//! Audit record and sink statistics.

use chrono::{DateTime, Utc};
use core_config::{env_bool, env_or_default, env_parse_or};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// What happened, e.g. "user.login" or "file.delete".
    pub action: String,
    /// Who did it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// What it happened to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Producer tag stamped at publish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_enabled: Option<bool>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            actor: None,
            resource: None,
            details,
            timestamp: Utc::now(),
            source: None,
            integrity_enabled: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Sink statistics exposed to the admin layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStats {
    pub processed_count: u64,
    pub error_count: u64,
    /// Successes over total attempts, in `[0, 1]`. 1.0 when idle.
    pub success_rate: f64,
    /// Broker queue depth, when observable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AuditStats {
    pub fn from_counters(processed: u64, errors: u64, last_error: Option<String>) -> Self {
        let total = processed + errors;
        let success_rate = if total == 0 {
            1.0
        } else {
            processed as f64 / total as f64
        };
        Self {
            processed_count: processed,
            error_count: errors,
            success_rate,
            queue_depth: None,
            last_error,
        }
    }
}

/// Configuration for the audit pipeline.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Broker queue audit records are published to.
    pub queue: String,
    /// Publish attempts against the primary before falling back.
    pub max_retries: u32,
    /// Annotate records with `integrity_enabled`.
    pub integrity_enabled: bool,
    /// Producer tag stamped into each record.
    pub source: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue: "audit.logs".to_string(),
            max_retries: 3,
            integrity_enabled: false,
            source: "dispatch".to_string(),
        }
    }
}

impl AuditConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue: env_or_default("AUDIT_RABBITMQ_QUEUE", &defaults.queue),
            max_retries: env_parse_or("AUDIT_MAX_RETRIES", defaults.max_retries).max(1),
            integrity_enabled: env_bool("AUDIT_INTEGRITY_ENABLED", false),
            source: env_or_default("AUDIT_SOURCE", &defaults.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_builder() {
        let record = AuditRecord::new("user.login", json!({ "ip": "10.0.0.1" }))
            .with_actor("alice")
            .with_resource("session/42");

        assert_eq!(record.action, "user.login");
        assert_eq!(record.actor.as_deref(), Some("alice"));
        assert_eq!(record.resource.as_deref(), Some("session/42"));
        assert!(record.source.is_none());
    }

    #[test]
    fn test_stats_success_rate() {
        let stats = AuditStats::from_counters(9, 1, None);
        assert_eq!(stats.processed_count, 9);
        assert!((stats.success_rate - 0.9).abs() < 1e-9);

        let idle = AuditStats::from_counters(0, 0, None);
        assert_eq!(idle.success_rate, 1.0);
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("AUDIT_RABBITMQ_QUEUE", Some("audit.events")),
                ("AUDIT_MAX_RETRIES", Some("5")),
                ("AUDIT_INTEGRITY_ENABLED", Some("true")),
            ],
            || {
                let config = AuditConfig::from_env();
                assert_eq!(config.queue, "audit.events");
                assert_eq!(config.max_retries, 5);
                assert!(config.integrity_enabled);
            },
        );
    }
}

//! Audit domain: fire-and-forget audit logging with broker primary and
//! direct fallback.
//!
//! Records go to a [`BrokerAuditSink`] (persistent AMQP publishes); when
//! the broker is unreachable the [`FallbackAuditor`] hands them to a
//! secondary [`AuditSink`] so audit writes never block on the broker.

pub mod broker_sink;
pub mod error;
pub mod fallback;
pub mod models;
pub mod sink;

pub use broker_sink::BrokerAuditSink;
pub use error::{AuditError, AuditResult};
pub use fallback::{ActiveSink, AuditHealth, FallbackAuditor, FallbackStats};
pub use models::{AuditConfig, AuditRecord, AuditStats};
pub use sink::{AuditSink, MemoryAuditSink};

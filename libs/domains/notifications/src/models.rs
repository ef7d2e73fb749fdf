//! Data models for the notifications domain.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Notifications
// ============================================================================

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    Slack,
    Webhook,
    InApp,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 6] = [
        Self::Email,
        Self::Sms,
        Self::Push,
        Self::Slack,
        Self::Webhook,
        Self::InApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
            Self::InApp => "in_app",
        }
    }

    /// Pause between items when batch-processing this channel, in
    /// milliseconds. Slower channels get more breathing room.
    pub fn delay_between_items_ms(&self) -> u64 {
        match self {
            Self::Email => 100,
            Self::Sms => 200,
            Self::Push => 50,
            Self::Slack => 300,
            Self::Webhook => 150,
            Self::InApp => 10,
        }
    }

    /// In-batch parallelism for this channel.
    pub fn max_concurrency(&self) -> usize {
        match self {
            Self::Email => 5,
            Self::Sms => 3,
            Self::Push => 10,
            Self::Slack => 2,
            Self::Webhook => 4,
            Self::InApp => 20,
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority of a notification; elevated priorities skip the normal bulk
/// collection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Critical,
    Urgent,
    High,
    Normal,
    Low,
}

impl NotificationPriority {
    pub const ELEVATED: [NotificationPriority; 3] = [Self::Critical, Self::Urgent, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Critical | Self::Urgent | Self::High)
    }
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery state of a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification owned by the repository collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Recipient user.
    pub user_id: Uuid,
    pub channel: NotificationChannel,
    pub priority: NotificationPriority,
    pub subject: String,
    /// Channel-specific payload.
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        channel: NotificationChannel,
        priority: NotificationPriority,
        subject: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            channel,
            priority,
            subject: subject.into(),
            payload,
            status: NotificationStatus::Queued,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Kind of batch job; doubles as the queue processor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    BulkNotification,
    UserBatch,
    ScheduledBatch,
    PriorityBatch,
}

impl BatchType {
    /// The processor name this batch type is routed to.
    pub fn processor_name(&self) -> &'static str {
        match self {
            Self::BulkNotification => "bulk-notification",
            Self::UserBatch => "user-batch",
            Self::ScheduledBatch => "scheduled-batch",
            Self::PriorityBatch => "priority-batch",
        }
    }
}

impl std::fmt::Display for BatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.processor_name())
    }
}

/// Per-batch processing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    /// Pause after each item, in milliseconds.
    pub delay_between_items_ms: u64,
    /// Parallel sends within the batch.
    pub max_concurrency: usize,
    /// Re-enqueue failed items through the retry path.
    pub retry_failed_items: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            delay_between_items_ms: 100,
            max_concurrency: 5,
            retry_failed_items: true,
        }
    }
}

impl BatchOptions {
    /// Channel-tuned options from the pacing and concurrency tables.
    pub fn for_channel(channel: NotificationChannel) -> Self {
        Self {
            delay_between_items_ms: channel.delay_between_items_ms(),
            max_concurrency: channel.max_concurrency(),
            retry_failed_items: true,
        }
    }
}

/// A batch job payload carried through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: String,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    #[serde(rename = "notifications")]
    pub notification_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<NotificationChannel>,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub processing_options: BatchOptions,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl BatchJob {
    pub fn new(
        batch_type: BatchType,
        notification_ids: Vec<Uuid>,
        channel: Option<NotificationChannel>,
        priority: NotificationPriority,
        processing_options: BatchOptions,
    ) -> Self {
        Self {
            id: format!("batch-{}", Uuid::new_v4()),
            batch_type,
            notification_ids,
            channel,
            priority,
            processing_options,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The recipient this batch belongs to (user batches only).
    pub fn user_id(&self) -> Option<Uuid> {
        self.metadata
            .get("userId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

/// Lifecycle of a batch record in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Repository record tracking one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub id: String,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// True when the batch was cancelled after some items went out.
    pub partially_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(batch: &BatchJob) -> Self {
        let now = Utc::now();
        Self {
            id: batch.id.clone(),
            batch_type: batch.batch_type,
            status: BatchStatus::Pending,
            total: batch.notification_ids.len(),
            processed: 0,
            failed: 0,
            cancelled: 0,
            partially_processed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Progress counters reported alongside a batch status change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub partially_processed: bool,
}

// ============================================================================
// User preferences
// ============================================================================

/// A daily window during which user batches must not be delivered.
/// Wraps across midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start <= self.end {
            at >= self.start && at < self.end
        } else {
            // Window wraps across midnight, e.g. 22:00 - 07:00
            at >= self.start || at < self.end
        }
    }

    /// Milliseconds from `at` until the window's end boundary.
    /// Zero when `at` is outside the window.
    pub fn ms_until_end(&self, at: NaiveTime) -> u64 {
        if !self.contains(at) {
            return 0;
        }

        let until = self.end.signed_duration_since(at);
        let ms = until.num_milliseconds();
        if ms >= 0 {
            ms as u64
        } else {
            // End boundary is tomorrow
            (ms + 24 * 3_600_000) as u64
        }
    }
}

/// Per-user delivery preferences, owned by the repository collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: Uuid,
    pub quiet_hours: Option<QuietHours>,
}

impl UserPreferences {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            quiet_hours: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_channel_pacing_table() {
        assert_eq!(NotificationChannel::Email.delay_between_items_ms(), 100);
        assert_eq!(NotificationChannel::Sms.delay_between_items_ms(), 200);
        assert_eq!(NotificationChannel::Push.delay_between_items_ms(), 50);
        assert_eq!(NotificationChannel::Slack.delay_between_items_ms(), 300);
        assert_eq!(NotificationChannel::Webhook.delay_between_items_ms(), 150);
        assert_eq!(NotificationChannel::InApp.delay_between_items_ms(), 10);
    }

    #[test]
    fn test_priority_elevation() {
        assert!(NotificationPriority::Critical.is_elevated());
        assert!(NotificationPriority::Urgent.is_elevated());
        assert!(NotificationPriority::High.is_elevated());
        assert!(!NotificationPriority::Normal.is_elevated());
        assert!(!NotificationPriority::Low.is_elevated());
    }

    #[test]
    fn test_batch_type_processor_names() {
        assert_eq!(BatchType::BulkNotification.processor_name(), "bulk-notification");
        assert_eq!(BatchType::UserBatch.processor_name(), "user-batch");
        assert_eq!(BatchType::ScheduledBatch.processor_name(), "scheduled-batch");
        assert_eq!(BatchType::PriorityBatch.processor_name(), "priority-batch");
    }

    #[test]
    fn test_batch_options_for_channel() {
        let opts = BatchOptions::for_channel(NotificationChannel::Slack);
        assert_eq!(opts.delay_between_items_ms, 300);
        assert_eq!(opts.max_concurrency, 2);
        assert!(opts.retry_failed_items);
    }

    #[test]
    fn test_batch_job_round_trip() {
        let batch = BatchJob::new(
            BatchType::BulkNotification,
            vec![Uuid::new_v4(), Uuid::new_v4()],
            Some(NotificationChannel::Email),
            NotificationPriority::Normal,
            BatchOptions::for_channel(NotificationChannel::Email),
        );

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["type"], "bulk_notification");
        assert_eq!(json["notifications"].as_array().unwrap().len(), 2);

        let back: BatchJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, batch.id);
        assert_eq!(back.batch_type, batch.batch_type);
        assert_eq!(back.notification_ids, batch.notification_ids);
    }

    #[test]
    fn test_batch_job_user_id_from_metadata() {
        let user = Uuid::new_v4();
        let batch = BatchJob::new(
            BatchType::UserBatch,
            vec![Uuid::new_v4()],
            None,
            NotificationPriority::Normal,
            BatchOptions::default(),
        )
        .with_metadata(serde_json::json!({ "userId": user.to_string() }));

        assert_eq!(batch.user_id(), Some(user));
    }

    #[test]
    fn test_quiet_hours_simple_window() {
        let quiet = QuietHours::new(t(9, 0), t(17, 0));
        assert!(quiet.contains(t(9, 0)));
        assert!(quiet.contains(t(12, 0)));
        assert!(!quiet.contains(t(17, 0)));
        assert!(!quiet.contains(t(8, 59)));
        assert!(!quiet.contains(t(22, 0)));
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let quiet = QuietHours::new(t(22, 0), t(7, 0));
        assert!(quiet.contains(t(23, 30)));
        assert!(quiet.contains(t(0, 0)));
        assert!(quiet.contains(t(6, 59)));
        assert!(!quiet.contains(t(7, 0)));
        assert!(!quiet.contains(t(12, 0)));
        assert!(!quiet.contains(t(21, 59)));
    }

    #[test]
    fn test_quiet_hours_ms_until_end() {
        let quiet = QuietHours::new(t(9, 0), t(17, 0));
        assert_eq!(quiet.ms_until_end(t(16, 0)), 3_600_000);
        assert_eq!(quiet.ms_until_end(t(18, 0)), 0);

        // Wrapping window: at 23:00 the end (07:00) is 8h away
        let quiet = QuietHours::new(t(22, 0), t(7, 0));
        assert_eq!(quiet.ms_until_end(t(23, 0)), 8 * 3_600_000);
        assert_eq!(quiet.ms_until_end(t(6, 0)), 3_600_000);
    }

    #[test]
    fn test_batch_record_from_job() {
        let batch = BatchJob::new(
            BatchType::PriorityBatch,
            vec![Uuid::new_v4(); 7],
            None,
            NotificationPriority::Critical,
            BatchOptions::default(),
        );
        let record = BatchRecord::new(&batch);

        assert_eq!(record.id, batch.id);
        assert_eq!(record.total, 7);
        assert_eq!(record.status, BatchStatus::Pending);
        assert!(!record.partially_processed);
        assert!(!record.status.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
    }
}

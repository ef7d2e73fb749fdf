//! Collaborator ports for the batch worker.
//!
//! The batch worker does not own notifications; it drives them through a
//! narrow repository port and hands delivery to a sender port. A clock port
//! keeps quiet-hours and backoff behavior deterministic in tests.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    BatchProgress, BatchRecord, BatchStatus, Notification, NotificationPriority,
    NotificationStatus, UserPreferences,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistence port for notifications and batch records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Queued notifications matching any of the given priorities, capped at
    /// `limit`, oldest first.
    async fn get_queued_notifications(
        &self,
        priorities: &[NotificationPriority],
        limit: usize,
    ) -> NotificationResult<Vec<Notification>>;

    async fn find_by_id(&self, id: Uuid) -> NotificationResult<Option<Notification>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> NotificationResult<()>;

    async fn create_batch_record(&self, record: BatchRecord) -> NotificationResult<()>;

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        progress: BatchProgress,
    ) -> NotificationResult<()>;

    async fn list_batch_records(&self) -> NotificationResult<Vec<BatchRecord>>;

    async fn get_user_preferences(&self, user_id: Uuid) -> NotificationResult<UserPreferences>;
}

/// Delivery port; one implementation per downstream provider stack.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> NotificationResult<()>;
}

/// Time source, injectable so quiet-hours windows are testable.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// In-memory repository for tests and local runs.
#[derive(Default)]
pub struct InMemoryRepository {
    notifications: Mutex<HashMap<Uuid, Notification>>,
    batches: Mutex<HashMap<String, BatchRecord>>,
    preferences: Mutex<HashMap<Uuid, UserPreferences>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_notification(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap()
            .insert(notification.id, notification);
    }

    pub fn insert_preferences(&self, preferences: UserPreferences) {
        self.preferences
            .lock()
            .unwrap()
            .insert(preferences.user_id, preferences);
    }

    pub fn notification_status(&self, id: Uuid) -> Option<NotificationStatus> {
        self.notifications
            .lock()
            .unwrap()
            .get(&id)
            .map(|n| n.status)
    }

    pub fn batch_record(&self, batch_id: &str) -> Option<BatchRecord> {
        self.batches.lock().unwrap().get(batch_id).cloned()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryRepository {
    async fn get_queued_notifications(
        &self,
        priorities: &[NotificationPriority],
        limit: usize,
    ) -> NotificationResult<Vec<Notification>> {
        let notifications = self.notifications.lock().unwrap();
        let mut queued: Vec<Notification> = notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Queued && priorities.contains(&n.priority))
            .cloned()
            .collect();
        queued.sort_by_key(|n| n.created_at);
        queued.truncate(limit);
        Ok(queued)
    }

    async fn find_by_id(&self, id: Uuid) -> NotificationResult<Option<Notification>> {
        Ok(self.notifications.lock().unwrap().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> NotificationResult<()> {
        let mut notifications = self.notifications.lock().unwrap();
        let notification = notifications
            .get_mut(&id)
            .ok_or(NotificationError::NotFound(id))?;
        notification.status = status;
        Ok(())
    }

    async fn create_batch_record(&self, record: BatchRecord) -> NotificationResult<()> {
        self.batches
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        progress: BatchProgress,
    ) -> NotificationResult<()> {
        let mut batches = self.batches.lock().unwrap();
        let record = batches
            .get_mut(batch_id)
            .ok_or_else(|| NotificationError::BatchNotFound(batch_id.to_string()))?;
        record.status = status;
        record.processed = progress.processed;
        record.failed = progress.failed;
        record.cancelled = progress.cancelled;
        record.partially_processed = progress.partially_processed;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_batch_records(&self) -> NotificationResult<Vec<BatchRecord>> {
        let mut records: Vec<BatchRecord> =
            self.batches.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn get_user_preferences(&self, user_id: Uuid) -> NotificationResult<UserPreferences> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| UserPreferences::new(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationChannel;
    use serde_json::json;

    fn notification(priority: NotificationPriority) -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationChannel::Email,
            priority,
            "hello",
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_get_queued_filters_by_priority_and_status() {
        let repo = InMemoryRepository::new();
        repo.insert_notification(notification(NotificationPriority::Normal));
        repo.insert_notification(notification(NotificationPriority::Critical));

        let mut sent = notification(NotificationPriority::Normal);
        sent.status = NotificationStatus::Sent;
        repo.insert_notification(sent);

        let queued = repo
            .get_queued_notifications(&[NotificationPriority::Normal], 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].priority, NotificationPriority::Normal);

        let elevated = repo
            .get_queued_notifications(&NotificationPriority::ELEVATED, 10)
            .await
            .unwrap();
        assert_eq!(elevated.len(), 1);
        assert_eq!(elevated[0].priority, NotificationPriority::Critical);
    }

    #[tokio::test]
    async fn test_get_queued_honors_limit_oldest_first() {
        let repo = InMemoryRepository::new();
        for _ in 0..5 {
            repo.insert_notification(notification(NotificationPriority::Low));
        }

        let queued = repo
            .get_queued_notifications(&[NotificationPriority::Low], 3)
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_update_status() {
        let repo = InMemoryRepository::new();
        let n = notification(NotificationPriority::Normal);
        let id = n.id;
        repo.insert_notification(n);

        repo.update_status(id, NotificationStatus::Sent).await.unwrap();
        assert_eq!(repo.notification_status(id), Some(NotificationStatus::Sent));

        let missing = repo
            .update_status(Uuid::new_v4(), NotificationStatus::Sent)
            .await;
        assert!(matches!(missing, Err(NotificationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_record_lifecycle() {
        use crate::models::{BatchJob, BatchOptions, BatchType};

        let repo = InMemoryRepository::new();
        let batch = BatchJob::new(
            BatchType::BulkNotification,
            vec![Uuid::new_v4(); 3],
            Some(NotificationChannel::Email),
            NotificationPriority::Normal,
            BatchOptions::default(),
        );
        repo.create_batch_record(BatchRecord::new(&batch)).await.unwrap();

        repo.update_batch_status(
            &batch.id,
            BatchStatus::Failed,
            BatchProgress {
                processed: 1,
                failed: 0,
                cancelled: 2,
                partially_processed: true,
            },
        )
        .await
        .unwrap();

        let record = repo.batch_record(&batch.id).unwrap();
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.processed, 1);
        assert_eq!(record.cancelled, 2);
        assert!(record.partially_processed);
    }

    #[tokio::test]
    async fn test_default_preferences_have_no_quiet_hours() {
        let repo = InMemoryRepository::new();
        let prefs = repo.get_user_preferences(Uuid::new_v4()).await.unwrap();
        assert!(prefs.quiet_hours.is_none());
    }
}

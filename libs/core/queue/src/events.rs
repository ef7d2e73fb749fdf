//! Typed queue events.
//!
//! Listeners subscribe through a broadcast channel; delivery is
//! at-least-once and per-job events arrive in lifecycle order
//! (`added -> active -> progress* -> completed|failed|removed`).

use crate::job::JobProgress;
use tokio::sync::broadcast;

/// Default capacity of a queue's event channel. Slow subscribers that fall
/// further behind than this see `RecvError::Lagged` and skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by a queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobAdded {
        job_id: String,
        name: String,
    },
    JobActive {
        job_id: String,
    },
    JobProgress {
        job_id: String,
        progress: JobProgress,
    },
    JobCompleted {
        job_id: String,
        return_value: Option<serde_json::Value>,
    },
    JobFailed {
        job_id: String,
        reason: String,
        attempts_made: u32,
    },
    JobStalled {
        job_id: String,
    },
    JobRemoved {
        job_id: String,
    },
    Paused,
    Resumed,
    Cleaned {
        removed: usize,
    },
    Error {
        message: String,
    },
    /// The last waiting job was consumed.
    Drained,
    /// The queue finished initialization and can dispatch.
    Ready,
}

impl QueueEvent {
    /// Stable event name for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job:added",
            Self::JobActive { .. } => "job:active",
            Self::JobProgress { .. } => "job:progress",
            Self::JobCompleted { .. } => "job:completed",
            Self::JobFailed { .. } => "job:failed",
            Self::JobStalled { .. } => "job:stalled",
            Self::JobRemoved { .. } => "job:removed",
            Self::Paused => "queue:paused",
            Self::Resumed => "queue:resumed",
            Self::Cleaned { .. } => "queue:cleaned",
            Self::Error { .. } => "queue:error",
            Self::Drained => "queue:drained",
            Self::Ready => "queue:ready",
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobAdded { job_id, .. }
            | Self::JobActive { job_id }
            | Self::JobProgress { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobStalled { job_id }
            | Self::JobRemoved { job_id } => Some(job_id),
            _ => None,
        }
    }
}

/// Broadcast fan-out for queue events.
///
/// Publishing never fails: with no subscribers the event is dropped, which
/// matches fire-and-forget event semantics.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(event = event.kind(), job_id = ?event.job_id(), "queue event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        let event = QueueEvent::JobAdded {
            job_id: "j1".to_string(),
            name: "send".to_string(),
        };
        assert_eq!(event.kind(), "job:added");
        assert_eq!(event.job_id(), Some("j1"));

        assert_eq!(QueueEvent::Drained.kind(), "queue:drained");
        assert_eq!(QueueEvent::Drained.job_id(), None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(QueueEvent::Ready);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(QueueEvent::JobAdded {
            job_id: "j1".to_string(),
            name: "send".to_string(),
        });
        bus.publish(QueueEvent::JobActive {
            job_id: "j1".to_string(),
        });
        bus.publish(QueueEvent::JobCompleted {
            job_id: "j1".to_string(),
            return_value: None,
        });

        assert_eq!(rx.recv().await.unwrap().kind(), "job:added");
        assert_eq!(rx.recv().await.unwrap().kind(), "job:active");
        assert_eq!(rx.recv().await.unwrap().kind(), "job:completed");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(QueueEvent::Paused);

        assert_eq!(rx1.recv().await.unwrap().kind(), "queue:paused");
        assert_eq!(rx2.recv().await.unwrap().kind(), "queue:paused");
    }
}

//! Queue factory and registry.
//!
//! Queues are registered by `(broker, name)`; asking for the same pair
//! twice returns the same instance. A process-wide factory is available via
//! [`QueueFactory::global`], but tests and embedders can construct their
//! own.

use crate::broker::BrokerQueue;
use crate::config::{BrokerKind, QueueConfig};
use crate::error::QueueError;
use crate::queue::Queue;
use crate::work_queue::WorkQueue;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

static GLOBAL_FACTORY: Lazy<Arc<QueueFactory>> = Lazy::new(|| Arc::new(QueueFactory::new()));

/// Registry of queue instances keyed by `(broker, name)`.
pub struct QueueFactory {
    queues: Mutex<HashMap<(BrokerKind, String), Arc<dyn Queue>>>,
}

impl QueueFactory {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide factory.
    pub fn global() -> Arc<QueueFactory> {
        Arc::clone(&GLOBAL_FACTORY)
    }

    /// Return the queue for `(config.broker, config.name)`, constructing it
    /// on first use.
    pub async fn create(&self, config: QueueConfig) -> Result<Arc<dyn Queue>, QueueError> {
        let key = (config.broker, config.name.clone());

        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(&key) {
            return Ok(Arc::clone(queue));
        }

        let queue: Arc<dyn Queue> = match config.broker {
            BrokerKind::Redis => Arc::new(WorkQueue::new(config).await?),
            BrokerKind::RabbitMq => Arc::new(BrokerQueue::new(config)),
        };

        info!(broker = %key.0, queue = %key.1, "Created queue instance");
        queues.insert(key, Arc::clone(&queue));
        Ok(queue)
    }

    /// Look up an existing queue without creating it.
    pub async fn get(&self, broker: BrokerKind, name: &str) -> Option<Arc<dyn Queue>> {
        let queues = self.queues.lock().await;
        queues.get(&(broker, name.to_string())).map(Arc::clone)
    }

    /// All registered queues, for the admin layer.
    pub async fn all(&self) -> Vec<Arc<dyn Queue>> {
        let queues = self.queues.lock().await;
        queues.values().map(Arc::clone).collect()
    }

    /// Registered `(broker, name)` keys.
    pub async fn keys(&self) -> Vec<(BrokerKind, String)> {
        let queues = self.queues.lock().await;
        queues.keys().cloned().collect()
    }

    /// Number of registered queues.
    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.is_empty()
    }

    /// Close every queue and clear the registry.
    pub async fn close_all(&self) -> Result<(), QueueError> {
        let drained: Vec<((BrokerKind, String), Arc<dyn Queue>)> = {
            let mut queues = self.queues.lock().await;
            queues.drain().collect()
        };

        for ((broker, name), queue) in drained {
            if let Err(e) = queue.close().await {
                warn!(broker = %broker, queue = %name, error = %e, "Error closing queue");
            }
        }
        Ok(())
    }

    /// Drop a single queue from the registry, closing it first.
    pub async fn remove(&self, broker: BrokerKind, name: &str) -> Result<bool, QueueError> {
        let queue = {
            let mut queues = self.queues.lock().await;
            queues.remove(&(broker, name.to_string()))
        };

        match queue {
            Some(queue) => {
                queue.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for QueueFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_starts_empty() {
        let factory = QueueFactory::new();
        assert!(factory.is_empty().await);
        assert_eq!(factory.len().await, 0);
        assert!(factory.get(BrokerKind::Redis, "mail").await.is_none());
    }

    #[tokio::test]
    async fn test_create_returns_same_instance_per_key() {
        let factory = QueueFactory::new();

        let config = QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq);
        let first = factory.create(config.clone()).await.unwrap();
        let second = factory.create(config).await.unwrap();

        assert_eq!(factory.len().await, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_same_name_different_broker_is_distinct() {
        let factory = QueueFactory::new();

        let amqp = factory
            .create(QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();

        // Only the key differs; both entries coexist
        assert_eq!(amqp.name(), "mail");
        assert_eq!(factory.len().await, 1);
        assert!(factory.get(BrokerKind::Redis, "mail").await.is_none());
        assert!(factory.get(BrokerKind::RabbitMq, "mail").await.is_some());
    }

    #[tokio::test]
    async fn test_close_all_clears_registry() {
        let factory = QueueFactory::new();
        factory
            .create(QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();
        factory
            .create(QueueConfig::new("audit").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();
        assert_eq!(factory.len().await, 2);

        factory.close_all().await.unwrap();
        assert!(factory.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_closes_and_unregisters() {
        let factory = QueueFactory::new();
        factory
            .create(QueueConfig::new("mail").with_broker(BrokerKind::RabbitMq))
            .await
            .unwrap();

        assert!(factory.remove(BrokerKind::RabbitMq, "mail").await.unwrap());
        assert!(!factory.remove(BrokerKind::RabbitMq, "mail").await.unwrap());
        assert!(factory.is_empty().await);
    }
}

//! Fanout of lifecycle events to subscriber queues.
//!
//! The bus holds no messages of its own: durability belongs to the subscriber
//! queues and a failed enqueue is reported, not retried.

use crate::event::LifecycleEvent;
use crate::queue::{QueueError, WorkQueue};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while managing subscriptions
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Subscriber already registered: {0}")]
    DuplicateSubscriber(String),

    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(String),
}

struct Subscription {
    name: String,
    queue: Arc<dyn WorkQueue>,
}

/// Per-subscriber outcome of a publish
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Subscribers that accepted the event
    pub delivered: Vec<String>,
    /// Subscribers whose queue rejected the event
    pub failed: Vec<(String, QueueError)>,
}

impl PublishReport {
    /// True if every subscriber accepted the event
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Broadcasts each event to every subscribed queue
#[derive(Default)]
pub struct FanoutBus {
    subscribers: RwLock<Vec<Subscription>>,
}

impl FanoutBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue under a unique subscriber name
    pub fn subscribe(&self, name: impl Into<String>, queue: Arc<dyn WorkQueue>) -> Result<(), BusError> {
        let name = name.into();
        let mut subscribers = self.subscribers.write();

        if subscribers.iter().any(|s| s.name == name) {
            return Err(BusError::DuplicateSubscriber(name));
        }

        info!(subscriber = %name, queue = %queue.name(), "Subscribed queue to fanout bus");
        subscribers.push(Subscription { name, queue });
        Ok(())
    }

    /// Remove a subscriber; events already enqueued stay in its queue
    pub fn unsubscribe(&self, name: &str) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.name != name);

        if subscribers.len() == before {
            return Err(BusError::UnknownSubscriber(name.to_string()));
        }
        Ok(())
    }

    /// Names of the current subscribers
    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Deliver an event to every current subscriber
    #[instrument(skip(self, event), fields(event_id = %event.event_id, store_id = %event.store_id))]
    pub async fn publish(&self, event: &LifecycleEvent) -> PublishReport {
        let targets: Vec<(String, Arc<dyn WorkQueue>)> = self
            .subscribers
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.queue.clone()))
            .collect();

        if targets.is_empty() {
            warn!("Published event with no subscribers");
            return PublishReport::default();
        }

        let deliveries = targets.into_iter().map(|(name, queue)| {
            let event = event.clone();
            async move { (name, queue.enqueue(event).await) }
        });

        let mut report = PublishReport::default();
        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(message_id) => {
                    debug!(subscriber = %name, message_id = %message_id, "Event delivered");
                    report.delivered.push(name);
                }
                Err(e) => {
                    error!(subscriber = %name, error = %e, "Failed to deliver event to subscriber");
                    metrics::counter!("pipeline.bus.delivery_failures", "subscriber" => name.clone())
                        .increment(1);
                    report.failed.push((name, e));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::{MemoryQueue, QueueMessage};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct BrokenQueue;

    #[async_trait]
    impl WorkQueue for BrokenQueue {
        fn name(&self) -> &str {
            "broken"
        }

        async fn enqueue(&self, _event: LifecycleEvent) -> Result<Uuid, QueueError> {
            Err(QueueError::EnqueueError("backend unavailable".to_string()))
        }

        async fn receive(&self) -> Result<Option<crate::queue::Lease>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _lease: &crate::queue::Lease) -> Result<(), QueueError> {
            Ok(())
        }

        async fn dead_letters(&self) -> Result<Vec<QueueMessage>, QueueError> {
            Ok(Vec::new())
        }

        async fn depth(&self) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = FanoutBus::new();
        let sizes = Arc::new(MemoryQueue::new("sizes", QueueConfig::default()));
        let logs = Arc::new(MemoryQueue::new("logs", QueueConfig::default()));
        bus.subscribe("size-tracking", sizes.clone()).unwrap();
        bus.subscribe("usage-logging", logs.clone()).unwrap();

        let report = bus.publish(&LifecycleEvent::created("a", "k", 3)).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(sizes.depth().await.unwrap(), 1);
        assert_eq!(logs.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscriber_does_not_block_others() {
        let bus = FanoutBus::new();
        let logs = Arc::new(MemoryQueue::new("logs", QueueConfig::default()));
        bus.subscribe("broken", Arc::new(BrokenQueue)).unwrap();
        bus.subscribe("usage-logging", logs.clone()).unwrap();

        let report = bus.publish(&LifecycleEvent::created("a", "k", 3)).await;

        assert_eq!(report.delivered, vec!["usage-logging".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(logs.depth().await.unwrap(), 1);
    }

    #[test]
    fn test_duplicate_subscriber_rejected() {
        let bus = FanoutBus::new();
        let queue = Arc::new(MemoryQueue::new("q", QueueConfig::default()));
        bus.subscribe("sub", queue.clone()).unwrap();
        assert!(matches!(
            bus.subscribe("sub", queue),
            Err(BusError::DuplicateSubscriber(_))
        ));
        bus.unsubscribe("sub").unwrap();
        assert!(bus.subscriber_names().is_empty());
    }
}

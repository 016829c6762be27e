//! Lease-based work queues with dead-letter handling.
//!
//! A dequeued message is leased to exactly one worker for the visibility timeout.
//! Acknowledging removes it; letting the lease lapse counts a failed delivery and
//! makes the message visible again. Once failed deliveries exceed
//! `max_receive_count` the message is moved to the queue's dead-letter list
//! instead of being redelivered.

use crate::config::QueueConfig;
use crate::event::LifecycleEvent;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to enqueue message: {0}")]
    EnqueueError(String),

    #[error("Failed to receive message: {0}")]
    ReceiveError(String),

    #[error("Lease {lease_id} on message {message_id} is no longer held")]
    LeaseLost { message_id: Uuid, lease_id: Uuid },

    #[error("Failed to acknowledge message: {0}")]
    AckError(String),
}

/// A lifecycle event plus its delivery metadata
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Queue-assigned message ID
    pub message_id: Uuid,
    /// Wrapped event
    pub event: LifecycleEvent,
    /// Number of failed deliveries so far
    pub receive_count: u32,
    /// End of the current visibility lease, if leased
    pub visibility_deadline: Option<Instant>,
}

/// Exclusive, time-bounded ownership of a message
#[derive(Debug, Clone)]
pub struct Lease {
    /// Unique per delivery; a redelivered message gets a new one
    pub lease_id: Uuid,
    /// Leased message snapshot
    pub message: QueueMessage,
}

impl Lease {
    /// The leased event
    pub fn event(&self) -> &LifecycleEvent {
        &self.message.event
    }

    /// When the lease lapses
    pub fn deadline(&self) -> Option<Instant> {
        self.message.visibility_deadline
    }
}

/// Durable work queue interface.
///
/// Implementations:
/// - `MemoryQueue`: in-process queue for tests and single-node runs
/// - `PgQueue` (storage-monitor): Postgres-backed queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Queue name, used for logging and metrics
    fn name(&self) -> &str;

    /// Append an event, returning its message ID
    async fn enqueue(&self, event: LifecycleEvent) -> Result<Uuid, QueueError>;

    /// Lease the next visible message, if any
    async fn receive(&self) -> Result<Option<Lease>, QueueError>;

    /// Permanently remove a leased message
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Messages that exhausted their retry budget
    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, QueueError>;

    /// Visible plus in-flight messages (dead letters excluded)
    async fn depth(&self) -> Result<usize, QueueError>;
}

/// Batch dequeue on top of [`WorkQueue::receive`]
pub trait WorkQueueExt: WorkQueue {
    /// Lazily lease up to `batch_size` messages.
    ///
    /// Each item acquires its lease only when the stream is polled, so a slow
    /// consumer does not hold leases on messages it has not started. The stream
    /// ends early when no message is visible; calling `dequeue` again starts a
    /// fresh sequence.
    fn dequeue(&self, batch_size: usize) -> BoxStream<'_, Result<Lease, QueueError>> {
        stream::unfold(0usize, move |taken| async move {
            if taken >= batch_size {
                return None;
            }
            match self.receive().await {
                Ok(Some(lease)) => Some((Ok(lease), taken + 1)),
                Ok(None) => None,
                Err(e) => Some((Err(e), batch_size)),
            }
        })
        .boxed()
    }
}

impl<Q: WorkQueue + ?Sized> WorkQueueExt for Q {}

#[derive(Debug)]
struct Slot {
    message: QueueMessage,
    lease_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: VecDeque<Slot>,
    dead: Vec<QueueMessage>,
}

/// In-process work queue with its own dead-letter list
pub struct MemoryQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Return lapsed leases to the queue, dead-lettering exhausted messages
    fn reclaim_expired(&self, state: &mut QueueState, now: Instant) {
        let mut kept = VecDeque::with_capacity(state.slots.len());

        while let Some(mut slot) = state.slots.pop_front() {
            let lapsed = slot.lease_id.is_some()
                && slot
                    .message
                    .visibility_deadline
                    .map(|deadline| deadline <= now)
                    .unwrap_or(true);

            if !lapsed {
                kept.push_back(slot);
                continue;
            }

            slot.lease_id = None;
            slot.message.visibility_deadline = None;
            slot.message.receive_count += 1;

            if slot.message.receive_count > self.config.max_receive_count {
                error!(
                    queue = %self.name,
                    message_id = %slot.message.message_id,
                    event_id = %slot.message.event.event_id,
                    receive_count = slot.message.receive_count,
                    "Retry budget exhausted, moving message to dead-letter queue"
                );
                metrics::counter!("pipeline.queue.dead_lettered", "queue" => self.name.clone())
                    .increment(1);
                state.dead.push(slot.message);
            } else {
                debug!(
                    queue = %self.name,
                    message_id = %slot.message.message_id,
                    receive_count = slot.message.receive_count,
                    "Lease expired, message visible again"
                );
                kept.push_back(slot);
            }
        }

        state.slots = kept;
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, event: LifecycleEvent) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();
        trace!(queue = %self.name, message_id = %message_id, event_id = %event.event_id, "Enqueued");

        self.state.lock().slots.push_back(Slot {
            message: QueueMessage {
                message_id,
                event,
                receive_count: 0,
                visibility_deadline: None,
            },
            lease_id: None,
        });

        Ok(message_id)
    }

    async fn receive(&self) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, now);

        let deadline = now + self.config.visibility_timeout();
        let lease = state
            .slots
            .iter_mut()
            .find(|slot| slot.lease_id.is_none())
            .map(|slot| {
                let lease_id = Uuid::new_v4();
                slot.lease_id = Some(lease_id);
                slot.message.visibility_deadline = Some(deadline);
                Lease {
                    lease_id,
                    message: slot.message.clone(),
                }
            });

        Ok(lease)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, Instant::now());

        let position = state.slots.iter().position(|slot| {
            slot.message.message_id == lease.message.message_id
                && slot.lease_id == Some(lease.lease_id)
        });

        match position {
            Some(index) => {
                state.slots.remove(index);
                Ok(())
            }
            None => Err(QueueError::LeaseLost {
                message_id: lease.message.message_id,
                lease_id: lease.lease_id,
            }),
        }
    }

    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, Instant::now());
        Ok(state.dead.clone())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, Instant::now());
        Ok(state.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_queue(max_receive_count: u32) -> MemoryQueue {
        MemoryQueue::new(
            "test",
            QueueConfig {
                max_receive_count,
                visibility_timeout_ms: 1000,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_message() {
        let queue = test_queue(3);
        queue.enqueue(LifecycleEvent::created("a", "k", 1)).await.unwrap();

        let lease = queue.receive().await.unwrap().unwrap();
        queue.ack(&lease).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leased_message_is_invisible() {
        let queue = test_queue(3);
        queue.enqueue(LifecycleEvent::created("a", "k", 1)).await.unwrap();

        let _lease = queue.receive().await.unwrap().unwrap();
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers() {
        let queue = test_queue(3);
        queue.enqueue(LifecycleEvent::created("a", "k", 1)).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.message.receive_count, 0);

        tokio::time::advance(Duration::from_millis(1001)).await;

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.message.message_id, first.message.message_id);
        assert_eq!(second.message.receive_count, 1);
        assert_ne!(second.lease_id, first.lease_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ack_rejected() {
        let queue = test_queue(3);
        queue.enqueue(LifecycleEvent::created("a", "k", 1)).await.unwrap();

        let stale = queue.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(1001)).await;
        let fresh = queue.receive().await.unwrap().unwrap();

        assert!(matches!(
            queue.ack(&stale).await,
            Err(QueueError::LeaseLost { .. })
        ));
        queue.ack(&fresh).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_dead_lettered() {
        let queue = test_queue(3);
        let event = LifecycleEvent::created("a", "k", 1);
        queue.enqueue(event.clone()).await.unwrap();

        // max_receive_count + 1 failed deliveries
        for _ in 0..4 {
            let lease = queue.receive().await.unwrap();
            assert!(lease.is_some());
            tokio::time::advance(Duration::from_millis(1001)).await;
        }

        assert!(queue.receive().await.unwrap().is_none());
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event, event);
        assert_eq!(dead[0].receive_count, 4);
        assert_eq!(queue.depth().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_respects_batch_size_and_restarts() {
        let queue = test_queue(3);
        for i in 0..5 {
            queue
                .enqueue(LifecycleEvent::created("a", format!("k{i}"), 1))
                .await
                .unwrap();
        }

        let first: Vec<_> = queue.dequeue(3).collect().await;
        assert_eq!(first.len(), 3);

        let second: Vec<_> = queue.dequeue(3).collect().await;
        assert_eq!(second.len(), 2);

        let third: Vec<_> = queue.dequeue(3).collect().await;
        assert!(third.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_receivers_get_distinct_messages() {
        let queue = Arc::new(test_queue(3));
        for i in 0..20 {
            queue
                .enqueue(LifecycleEvent::created("a", format!("k{i}"), 1))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(lease) = queue.receive().await.unwrap() {
                    ids.push(lease.message.message_id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "message leased twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }
}

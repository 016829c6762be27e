//! Queue workers for the usage pipeline.
//!
//! A worker repeatedly leases a batch from its queue, hands each event to a
//! [`MessageHandler`], and acknowledges only on success. A failed event is left
//! unacknowledged so its lease lapses and the queue redelivers it; there is no
//! rollback, so handlers must tolerate re-execution.

use crate::config::QueueConfig;
use crate::event::LifecycleEvent;
use crate::queue::{Lease, QueueError, QueueMessage, WorkQueue, WorkQueueExt};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Consumer shutdown")]
    Shutdown,
}

/// Handler trait for processing events
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single event
    async fn handle(&self, event: &LifecycleEvent) -> Result<(), ConsumerError>;

    /// Called when processing fails; the message stays leased until it lapses
    async fn on_error(&self, message: &QueueMessage, error: &ConsumerError) {
        warn!(
            message_id = %message.message_id,
            event_id = %message.event.event_id,
            receive_count = message.receive_count,
            error = %error,
            "Message processing failed, leaving for redelivery"
        );
    }
}

/// Function-based message handler
pub struct FnHandler<F>
where
    F: Fn(&LifecycleEvent) -> Result<(), ConsumerError> + Send + Sync,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&LifecycleEvent) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&LifecycleEvent) -> Result<(), ConsumerError> + Send + Sync,
{
    async fn handle(&self, event: &LifecycleEvent) -> Result<(), ConsumerError> {
        (self.handler)(event)
    }
}

/// Outcome counts for one polled batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub acked: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.acked == 0 && self.failed == 0
    }
}

/// A single consumer loop bound to one queue and one handler
pub struct QueueWorker<H: MessageHandler> {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<H>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl<H: MessageHandler> QueueWorker<H> {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        handler: Arc<H>,
        config: QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown,
        }
    }

    /// Lease and process at most one batch
    pub async fn poll_once(&self) -> Result<BatchOutcome, ConsumerError> {
        let mut outcome = BatchOutcome::default();
        let mut leases = self.queue.dequeue(self.config.batch_size);

        while let Some(lease) = leases.next().await {
            if self.process(lease?).await {
                outcome.acked += 1;
            } else {
                outcome.failed += 1;
            }
        }

        Ok(outcome)
    }

    async fn process(&self, lease: Lease) -> bool {
        let queue = self.queue.name();

        match self.handler.handle(lease.event()).await {
            Ok(()) => match self.queue.ack(&lease).await {
                Ok(()) => {
                    debug!(queue = %queue, message_id = %lease.message.message_id, "Message acknowledged");
                    metrics::counter!("pipeline.messages.processed", "queue" => queue.to_string())
                        .increment(1);
                    true
                }
                Err(e) => {
                    // The handler ran but the message will be redelivered
                    warn!(queue = %queue, error = %e, "Failed to acknowledge processed message");
                    metrics::counter!("pipeline.messages.ack_failed", "queue" => queue.to_string())
                        .increment(1);
                    false
                }
            },
            Err(e) => {
                self.handler.on_error(&lease.message, &e).await;
                metrics::counter!("pipeline.messages.failed", "queue" => queue.to_string())
                    .increment(1);
                false
            }
        }
    }

    /// Consume until shutdown is signalled.
    ///
    /// Cancellation may interrupt a handler mid-flight; its lease simply lapses.
    #[instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn run(&self) -> Result<(), ConsumerError> {
        info!("Starting queue worker");

        loop {
            let idle = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.poll_once() => match result {
                    Ok(outcome) => outcome.is_empty(),
                    Err(e) => {
                        error!(error = %e, "Queue poll failed");
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        info!("Queue worker stopped");
        Ok(())
    }
}

/// A horizontally scaled set of workers sharing one queue
pub struct WorkerPool {
    name: String,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers on the current runtime
    pub fn spawn<H: MessageHandler + 'static>(
        name: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        handler: Arc<H>,
        config: &QueueConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let name = name.into();
        let shutdown = shutdown.child_token();
        let mut tasks = JoinSet::new();

        for index in 0..config.workers {
            let worker = QueueWorker::new(
                queue.clone(),
                handler.clone(),
                config.clone(),
                shutdown.clone(),
            );
            let pool = name.clone();
            tasks.spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(pool = %pool, worker = index, error = %e, "Worker exited with error");
                }
            });
        }

        info!(pool = %name, workers = config.workers, "Worker pool started");

        Self {
            name,
            shutdown,
            tasks,
        }
    }

    /// Signal every worker to stop and wait for them
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(pool = %self.name, error = %e, "Worker task panicked");
            }
        }
        info!(pool = %self.name, "Worker pool stopped");
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

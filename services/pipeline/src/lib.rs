//! Usage Pipeline - lifecycle event fanout and lease-based work queues
//!
//! This library provides the messaging layer of the storage usage monitor:
//!
//! - Lifecycle events (object created / removed) and notification decoding
//! - A fanout bus that copies each event into every subscriber queue
//! - Work queues with visibility leases, redelivery and dead-lettering
//! - Queue workers and worker pools that drive a [`MessageHandler`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use usage_pipeline::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QueueConfig::from_env()?;
//!     let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("size-tracking", config.clone()));
//!
//!     let bus = FanoutBus::new();
//!     bus.subscribe("size-tracking", queue.clone())?;
//!     bus.publish(&LifecycleEvent::created("store-a", "report.txt", 19)).await;
//!
//!     let handler = Arc::new(FnHandler::new(|event: &LifecycleEvent| {
//!         println!("{} {:?}", event.object_key, event.event_type);
//!         Ok(())
//!     }));
//!     let shutdown = CancellationToken::new();
//!     let pool = WorkerPool::spawn("size-tracking", queue, handler, &config, &shutdown);
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod event;
pub mod queue;
pub mod worker;

// Re-export main types
pub use bus::{BusError, FanoutBus, PublishReport};
pub use config::{ConfigError, QueueConfig};
pub use event::{decode_notification, EventError, EventType, LifecycleEvent};
pub use queue::{Lease, MemoryQueue, QueueError, QueueMessage, WorkQueue, WorkQueueExt};
pub use worker::{
    BatchOutcome, ConsumerError, FnHandler, MessageHandler, QueueWorker, WorkerPool,
};

pub use worker::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::FanoutBus;
    pub use crate::config::QueueConfig;
    pub use crate::event::{EventType, LifecycleEvent};
    pub use crate::queue::{MemoryQueue, WorkQueue, WorkQueueExt};
    pub use crate::worker::{
        async_trait, ConsumerError, FnHandler, MessageHandler, WorkerPool,
    };
}

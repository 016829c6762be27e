use crate::config::TrackingConfig;
use crate::delta_log::{DeltaLog, DeltaLogRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use usage_pipeline::{ConsumerError, EventType, LifecycleEvent, MessageHandler};

/// Writes one signed delta record per lifecycle event
pub struct UsageLogger {
    log: Arc<dyn DeltaLog>,
    tracking: TrackingConfig,
}

impl UsageLogger {
    pub fn new(log: Arc<dyn DeltaLog>, tracking: TrackingConfig) -> Self {
        Self { log, tracking }
    }

    /// Build and append the delta record for `event`.
    ///
    /// Removal notifications usually carry no size; those take the size of the
    /// object's most recent logged creation.
    #[instrument(skip(self, event), fields(store_id = %event.store_id, event_id = %event.event_id))]
    pub async fn record(&self, event: &LifecycleEvent) -> Result<Option<DeltaLogRecord>, ConsumerError> {
        if self.tracking.is_ignored(&event.object_key) {
            debug!(object_key = %event.object_key, "Ignoring event for excluded key");
            return Ok(None);
        }

        let size_delta = match (event.event_type, event.size_bytes) {
            (EventType::Removed, 0) => {
                let resolved = self
                    .log
                    .last_creation_size(&event.store_id, &event.object_key)
                    .await?;
                match resolved {
                    Some(size) => -i64::try_from(size).unwrap_or(i64::MAX),
                    None => {
                        warn!(
                            object_key = %event.object_key,
                            "No logged creation for removed object, writing zero delta"
                        );
                        0
                    }
                }
            }
            _ => event.size_delta(),
        };

        let record = DeltaLogRecord {
            event_id: event.event_id,
            store_id: event.store_id.clone(),
            object_key: event.object_key.clone(),
            size_delta,
            timestamp: event.timestamp,
        };

        let Some(offset) = self.log.append(&record).await? else {
            debug!("Delta already logged, skipping");
            return Ok(None);
        };

        info!(
            target: "usage_delta",
            offset = offset,
            store_id = %record.store_id,
            object_key = %record.object_key,
            size_delta = record.size_delta,
            timestamp = %record.timestamp.to_rfc3339(),
            "Usage delta"
        );
        metrics::counter!("monitor.usage_logger.deltas_written").increment(1);

        Ok(Some(record))
    }
}

#[async_trait]
impl MessageHandler for UsageLogger {
    async fn handle(&self, event: &LifecycleEvent) -> Result<(), ConsumerError> {
        self.record(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta_log::MemoryDeltaLog;

    fn logger(log: Arc<MemoryDeltaLog>) -> UsageLogger {
        UsageLogger::new(log, TrackingConfig::default())
    }

    #[tokio::test]
    async fn test_deltas_are_signed() {
        let log = Arc::new(MemoryDeltaLog::new());
        let logger = logger(log.clone());

        logger
            .record(&LifecycleEvent::created("A", "x", 15))
            .await
            .unwrap();
        logger
            .record(&LifecycleEvent::removed("A", "x", 15))
            .await
            .unwrap();

        let deltas: Vec<i64> = log
            .read_from(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.record.size_delta)
            .collect();
        assert_eq!(deltas, vec![15, -15]);
    }

    #[tokio::test]
    async fn test_sizeless_removal_resolved_from_log() {
        let log = Arc::new(MemoryDeltaLog::new());
        let logger = logger(log.clone());

        logger
            .record(&LifecycleEvent::created("A", "report.txt", 47))
            .await
            .unwrap();
        let removal = logger
            .record(&LifecycleEvent::removed("A", "report.txt", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removal.size_delta, -47);

        let unknown = logger
            .record(&LifecycleEvent::removed("A", "never-seen", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unknown.size_delta, 0);
    }

    #[tokio::test]
    async fn test_redelivered_event_logged_once() {
        let log = Arc::new(MemoryDeltaLog::new());
        let logger = logger(log.clone());
        let event = LifecycleEvent::created("A", "x", 15);

        assert!(logger.record(&event).await.unwrap().is_some());
        logger.handle(&event).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_key_not_logged() {
        let log = Arc::new(MemoryDeltaLog::new());
        let logger = logger(log.clone());

        logger
            .record(&LifecycleEvent::created("A", "plot", 512))
            .await
            .unwrap();
        assert!(log.is_empty());
    }
}

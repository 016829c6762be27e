use crate::config::TrackingConfig;
use crate::usage_store::{AppendOutcome, ObjectChange, UsageRecord, UsageTable};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use usage_pipeline::{ConsumerError, EventType, LifecycleEvent, MessageHandler};

/// Compare-and-append attempts before the event is left for redelivery
const MAX_APPEND_ATTEMPTS: usize = 5;

/// Keeps the authoritative running byte total per store.
///
/// Every event reads the store's latest record, applies the size change and
/// appends the result, conditional on nobody having appended in between.
/// Removals that arrive without a size take the object's remembered size.
pub struct SizeTracker {
    table: Arc<dyn UsageTable>,
    tracking: TrackingConfig,
}

impl SizeTracker {
    pub fn new(table: Arc<dyn UsageTable>, tracking: TrackingConfig) -> Self {
        Self { table, tracking }
    }

    /// Fold one event into its store's timeline.
    ///
    /// Returns the appended record, or `None` when the event was ignored or
    /// had already been applied.
    #[instrument(skip(self, event), fields(store_id = %event.store_id, event_id = %event.event_id))]
    pub async fn apply(&self, event: &LifecycleEvent) -> Result<Option<UsageRecord>, ConsumerError> {
        if self.tracking.is_ignored(&event.object_key) {
            debug!(object_key = %event.object_key, "Ignoring event for excluded key");
            return Ok(None);
        }

        let dedup_key = self.tracking.dedup_enabled.then_some(event.event_id);

        let object = match event.event_type {
            EventType::Created => ObjectChange::Created {
                object_key: &event.object_key,
                size_bytes: event.size_bytes,
            },
            EventType::Removed => ObjectChange::Removed {
                object_key: &event.object_key,
            },
        };

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let previous = self.table.latest(&event.store_id).await?;
            let size_bytes = self.effective_size(event).await?;
            let record = next_record(previous.as_ref(), event, size_bytes, Utc::now());
            let expected = previous.as_ref().map(|p| p.timestamp);

            match self.table.append(&record, expected, dedup_key, Some(object)).await? {
                AppendOutcome::Appended => {
                    info!(
                        cumulative_bytes = record.cumulative_bytes,
                        object_count = record.object_count,
                        "Usage record appended"
                    );
                    metrics::counter!("monitor.size_tracker.records_appended").increment(1);
                    metrics::gauge!("monitor.store.cumulative_bytes", "store_id" => record.store_id.clone())
                        .set(record.cumulative_bytes as f64);
                    return Ok(Some(record));
                }
                AppendOutcome::Duplicate => {
                    debug!("Event already applied, skipping");
                    metrics::counter!("monitor.size_tracker.duplicates").increment(1);
                    return Ok(None);
                }
                AppendOutcome::Conflict => {
                    debug!(attempt = attempt, "Concurrent append detected, retrying");
                }
            }
        }

        Err(ConsumerError::PersistenceError(format!(
            "store {} kept changing after {} append attempts",
            event.store_id, MAX_APPEND_ATTEMPTS
        )))
    }

    async fn effective_size(&self, event: &LifecycleEvent) -> Result<u64, ConsumerError> {
        if event.event_type != EventType::Removed || event.size_bytes != 0 {
            return Ok(event.size_bytes);
        }

        match self
            .table
            .object_size(&event.store_id, &event.object_key)
            .await?
        {
            Some(size) => {
                debug!(object_key = %event.object_key, size_bytes = size, "Resolved removal size");
                Ok(size)
            }
            None => {
                warn!(
                    object_key = %event.object_key,
                    "No tracked size for removed object, applying zero"
                );
                metrics::counter!("monitor.size_tracker.unresolved_removals").increment(1);
                Ok(0)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for SizeTracker {
    async fn handle(&self, event: &LifecycleEvent) -> Result<(), ConsumerError> {
        self.apply(event).await.map(|_| ())
    }
}

/// The record that results from applying `event` on top of `previous`
fn next_record(
    previous: Option<&UsageRecord>,
    event: &LifecycleEvent,
    size_bytes: u64,
    now: DateTime<Utc>,
) -> UsageRecord {
    let (bytes, count) = previous
        .map(|p| (p.cumulative_bytes, p.object_count))
        .unwrap_or((0, 0));

    let (cumulative_bytes, object_count) = match event.event_type {
        EventType::Created => (bytes.saturating_add(size_bytes), count.saturating_add(1)),
        EventType::Removed => {
            if size_bytes > bytes {
                warn!(
                    store_id = %event.store_id,
                    object_key = %event.object_key,
                    previous_bytes = bytes,
                    size_bytes = size_bytes,
                    "Removal exceeds tracked total, clamping to zero"
                );
            }
            (
                bytes.saturating_sub(size_bytes),
                count.saturating_sub(1),
            )
        }
    };

    // Stored timestamps have microsecond precision and must strictly increase
    let mut timestamp = now.trunc_subsecs(6);
    if let Some(p) = previous {
        if timestamp <= p.timestamp {
            timestamp = p.timestamp + Duration::microseconds(1);
        }
    }

    UsageRecord {
        store_id: event.store_id.clone(),
        timestamp,
        cumulative_bytes,
        object_count,
    }
}

use crate::delta_log::DeltaLog;
use crate::usage_store::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sums delta records into fixed evaluation windows.
///
/// Each window is recomputed from the log when it is evaluated, so records
/// whose offsets became visible out of order are still counted. A window that
/// saw no records has no reading, which is distinct from a reading of zero.
pub struct MetricExtractor {
    log: Arc<dyn DeltaLog>,
    store_id: Option<String>,
    period_ms: i64,
    evaluated_through: Option<i64>,
}

impl MetricExtractor {
    pub fn new(log: Arc<dyn DeltaLog>, period: Duration) -> Self {
        Self {
            log,
            store_id: None,
            period_ms: i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1),
            evaluated_through: None,
        }
    }

    /// Only aggregate records for one store
    pub fn for_store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    /// Window containing `timestamp`
    pub fn window_index(&self, timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp_millis().div_euclid(self.period_ms)
    }

    /// First instant of window `index`
    pub fn window_start(&self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(index.saturating_mul(self.period_ms))
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Latest window closed so far
    pub fn evaluated_through(&self) -> Option<i64> {
        self.evaluated_through
    }

    /// Sum the window containing `window_start`, or `None` if no record fell
    /// in it. Records that land in a window after its evaluation are not
    /// counted anywhere.
    pub async fn evaluate(&mut self, window_start: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        let index = self.window_index(window_start);
        let start = self.window_start(index);
        let end = self.window_start(index.saturating_add(1));
        let reading = self
            .log
            .window_sum(self.store_id.as_deref(), start, end)
            .await?;
        debug!(window = index, reading = ?reading, "Window summed");

        self.evaluated_through = Some(self.evaluated_through.map_or(index, |d| d.max(index)));
        Ok(reading)
    }
}

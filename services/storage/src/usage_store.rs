use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, instrument};
use usage_pipeline::ConsumerError;
use uuid::Uuid;

/// Errors raised by the usage table and delta log backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Value out of range for {field}")]
    OutOfRange { field: &'static str },
}

impl From<StoreError> for ConsumerError {
    fn from(e: StoreError) -> Self {
        ConsumerError::PersistenceError(e.to_string())
    }
}

/// One point on a store's usage timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Partition key
    pub store_id: String,
    /// Sort key, strictly increasing per store
    pub timestamp: DateTime<Utc>,
    /// Running byte total after the triggering event
    pub cumulative_bytes: u64,
    /// Running object count after the triggering event
    pub object_count: u64,
}

/// Result of a conditional append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record written
    Appended,
    /// The de-duplication key was already applied; nothing written
    Duplicate,
    /// Another writer appended since `expected_previous` was read
    Conflict,
}

/// Effect of an event on the remembered size of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectChange<'a> {
    /// Remember `size_bytes` as the object's current size
    Created { object_key: &'a str, size_bytes: u64 },
    /// Forget the object
    Removed { object_key: &'a str },
}

/// Keyed store for usage timelines.
///
/// Implementations:
/// - `MemoryUsageTable`: in-process table for tests and database-less runs
/// - `PgUsageTable`: PostgreSQL-backed table
#[async_trait]
pub trait UsageTable: Send + Sync {
    /// Most recent record for a store
    async fn latest(&self, store_id: &str) -> Result<Option<UsageRecord>, StoreError>;

    /// Append `record` if the store's latest timestamp is still
    /// `expected_previous` and `dedup_key` (when given) was never applied.
    /// `object` is applied to the remembered object sizes in the same step.
    async fn append(
        &self,
        record: &UsageRecord,
        expected_previous: Option<DateTime<Utc>>,
        dedup_key: Option<Uuid>,
        object: Option<ObjectChange<'_>>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Last created size of an object that has not been removed since
    async fn object_size(&self, store_id: &str, object_key: &str) -> Result<Option<u64>, StoreError>;

    /// Records at or after `since`, oldest first
    async fn history(
        &self,
        store_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    /// Largest cumulative size ever recorded for a store
    async fn peak_bytes(&self, store_id: &str) -> Result<Option<u64>, StoreError>;
}

#[derive(Debug, Default)]
struct Timeline {
    records: Vec<UsageRecord>,
    applied: HashSet<Uuid>,
    objects: HashMap<String, u64>,
}

/// In-process usage table
#[derive(Debug, Default)]
pub struct MemoryUsageTable {
    timelines: Mutex<HashMap<String, Timeline>>,
}

impl MemoryUsageTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageTable for MemoryUsageTable {
    async fn latest(&self, store_id: &str) -> Result<Option<UsageRecord>, StoreError> {
        Ok(self
            .timelines
            .lock()
            .get(store_id)
            .and_then(|t| t.records.last().cloned()))
    }

    async fn append(
        &self,
        record: &UsageRecord,
        expected_previous: Option<DateTime<Utc>>,
        dedup_key: Option<Uuid>,
        object: Option<ObjectChange<'_>>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut timelines = self.timelines.lock();
        let timeline = timelines.entry(record.store_id.clone()).or_default();

        if let Some(key) = dedup_key {
            if timeline.applied.contains(&key) {
                return Ok(AppendOutcome::Duplicate);
            }
        }

        if timeline.records.last().map(|r| r.timestamp) != expected_previous {
            return Ok(AppendOutcome::Conflict);
        }

        timeline.records.push(record.clone());
        if let Some(key) = dedup_key {
            timeline.applied.insert(key);
        }
        match object {
            Some(ObjectChange::Created { object_key, size_bytes }) => {
                timeline.objects.insert(object_key.to_string(), size_bytes);
            }
            Some(ObjectChange::Removed { object_key }) => {
                timeline.objects.remove(object_key);
            }
            None => {}
        }
        Ok(AppendOutcome::Appended)
    }

    async fn object_size(&self, store_id: &str, object_key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .timelines
            .lock()
            .get(store_id)
            .and_then(|t| t.objects.get(object_key).copied()))
    }

    async fn history(
        &self,
        store_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        Ok(self
            .timelines
            .lock()
            .get(store_id)
            .map(|t| {
                t.records
                    .iter()
                    .filter(|r| r.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn peak_bytes(&self, store_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .timelines
            .lock()
            .get(store_id)
            .and_then(|t| t.records.iter().map(|r| r.cumulative_bytes).max()))
    }
}

/// Usage table in PostgreSQL
pub struct PgUsageTable {
    pool: PgPool,
}

impl PgUsageTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn to_db(field: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { field })
}

pub(crate) fn from_db(field: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange { field })
}

fn record_from_row(row: &PgRow) -> Result<UsageRecord, StoreError> {
    Ok(UsageRecord {
        store_id: row.try_get("store_id")?,
        timestamp: row.try_get("timestamp")?,
        cumulative_bytes: from_db("cumulative_bytes", row.try_get("cumulative_bytes")?)?,
        object_count: from_db("object_count", row.try_get("object_count")?)?,
    })
}

#[async_trait]
impl UsageTable for PgUsageTable {
    async fn latest(&self, store_id: &str) -> Result<Option<UsageRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT store_id, timestamp, cumulative_bytes, object_count
            FROM usage_records
            WHERE store_id = $1
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self, record, object), fields(store_id = %record.store_id))]
    async fn append(
        &self,
        record: &UsageRecord,
        expected_previous: Option<DateTime<Utc>>,
        dedup_key: Option<Uuid>,
        object: Option<ObjectChange<'_>>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize writers per store for the duration of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.store_id)
            .execute(&mut *tx)
            .await?;

        if let Some(event_id) = dedup_key {
            let inserted = sqlx::query(
                r#"
                INSERT INTO applied_events (store_id, event_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&record.store_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await?;
                debug!(event_id = %event_id, "Event already applied");
                return Ok(AppendOutcome::Duplicate);
            }
        }

        let previous: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(timestamp) FROM usage_records WHERE store_id = $1",
        )
        .bind(&record.store_id)
        .fetch_one(&mut *tx)
        .await?;

        if previous != expected_previous {
            tx.rollback().await?;
            return Ok(AppendOutcome::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO usage_records (store_id, timestamp, cumulative_bytes, object_count)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.store_id)
        .bind(record.timestamp)
        .bind(to_db("cumulative_bytes", record.cumulative_bytes)?)
        .bind(to_db("object_count", record.object_count)?)
        .execute(&mut *tx)
        .await?;

        match object {
            Some(ObjectChange::Created { object_key, size_bytes }) => {
                sqlx::query(
                    r#"
                    INSERT INTO object_sizes (store_id, object_key, size_bytes)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (store_id, object_key)
                    DO UPDATE SET size_bytes = EXCLUDED.size_bytes
                    "#,
                )
                .bind(&record.store_id)
                .bind(object_key)
                .bind(to_db("size_bytes", size_bytes)?)
                .execute(&mut *tx)
                .await?;
            }
            Some(ObjectChange::Removed { object_key }) => {
                sqlx::query("DELETE FROM object_sizes WHERE store_id = $1 AND object_key = $2")
                    .bind(&record.store_id)
                    .bind(object_key)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        tx.commit().await?;
        Ok(AppendOutcome::Appended)
    }

    async fn object_size(&self, store_id: &str, object_key: &str) -> Result<Option<u64>, StoreError> {
        let size: Option<i64> = sqlx::query_scalar(
            "SELECT size_bytes FROM object_sizes WHERE store_id = $1 AND object_key = $2",
        )
        .bind(store_id)
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?;

        size.map(|s| from_db("size_bytes", s)).transpose()
    }

    async fn history(
        &self,
        store_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT store_id, timestamp, cumulative_bytes, object_count
            FROM usage_records
            WHERE store_id = $1 AND timestamp >= $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(store_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn peak_bytes(&self, store_id: &str) -> Result<Option<u64>, StoreError> {
        let peak: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(cumulative_bytes) FROM usage_records WHERE store_id = $1",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;

        peak.map(|v| from_db("cumulative_bytes", v)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(store: &str, ts: DateTime<Utc>, bytes: u64) -> UsageRecord {
        UsageRecord {
            store_id: store.to_string(),
            timestamp: ts,
            cumulative_bytes: bytes,
            object_count: 1,
        }
    }

    #[tokio::test]
    async fn test_append_checks_expected_previous() {
        let table = MemoryUsageTable::new();
        let t0 = Utc::now();

        let first = record("a", t0, 10);
        assert_eq!(
            table.append(&first, None, None, None).await.unwrap(),
            AppendOutcome::Appended
        );

        // A writer that read an empty timeline is now stale
        let stale = record("a", t0 + Duration::seconds(1), 5);
        assert_eq!(
            table.append(&stale, None, None, None).await.unwrap(),
            AppendOutcome::Conflict
        );

        assert_eq!(table.latest("a").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_dedup_key_applied_once() {
        let table = MemoryUsageTable::new();
        let key = Uuid::new_v4();
        let t0 = Utc::now();

        let first = record("a", t0, 10);
        table.append(&first, None, Some(key), None).await.unwrap();

        let again = record("a", t0 + Duration::seconds(1), 20);
        assert_eq!(
            table.append(&again, Some(t0), Some(key), None).await.unwrap(),
            AppendOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_history_and_peak() {
        let table = MemoryUsageTable::new();
        let t0 = Utc::now();
        let mut previous = None;
        for (i, bytes) in [10u64, 47, 19].into_iter().enumerate() {
            let r = record("a", t0 + Duration::seconds(i as i64), bytes);
            table.append(&r, previous, None, None).await.unwrap();
            previous = Some(r.timestamp);
        }

        let recent = table.history("a", t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.cumulative_bytes).collect::<Vec<_>>(),
            vec![47, 19]
        );
        assert_eq!(table.peak_bytes("a").await.unwrap(), Some(47));
        assert_eq!(table.peak_bytes("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_object_sizes_follow_appends() {
        let table = MemoryUsageTable::new();
        let t0 = Utc::now();
        let created = ObjectChange::Created {
            object_key: "report.txt",
            size_bytes: 47,
        };

        table
            .append(&record("a", t0, 47), None, None, Some(created))
            .await
            .unwrap();
        assert_eq!(table.object_size("a", "report.txt").await.unwrap(), Some(47));

        // A rejected append leaves the remembered sizes alone
        let stale = record("a", t0 + Duration::seconds(1), 0);
        let removed = ObjectChange::Removed {
            object_key: "report.txt",
        };
        assert_eq!(
            table.append(&stale, None, None, Some(removed)).await.unwrap(),
            AppendOutcome::Conflict
        );
        assert_eq!(table.object_size("a", "report.txt").await.unwrap(), Some(47));

        table
            .append(&stale, Some(t0), None, Some(removed))
            .await
            .unwrap();
        assert_eq!(table.object_size("a", "report.txt").await.unwrap(), None);
    }
}

use crate::usage_store::{from_db, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// One signed size change, as written by the usage logger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLogRecord {
    /// Event that produced the record
    pub event_id: Uuid,
    pub store_id: String,
    pub object_key: String,
    /// +size for a creation, -size for a removal
    pub size_delta: i64,
    pub timestamp: DateTime<Utc>,
}

/// A record together with its position in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub record: DeltaLogRecord,
}

/// Append-only stream of delta records.
///
/// Offsets are assigned on append and only grow; readers keep their own cursor.
/// Concurrent appends may become visible out of offset order, so aggregates
/// over time ranges go through [`DeltaLog::window_sum`].
#[async_trait]
pub trait DeltaLog: Send + Sync {
    /// Append a record, returning its offset, or `None` if a record for the
    /// same event is already in the log
    async fn append(&self, record: &DeltaLogRecord) -> Result<Option<u64>, StoreError>;

    /// Up to `limit` entries with offset >= `offset`, in offset order
    async fn read_from(&self, offset: u64, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// Size of the most recent creation logged for an object
    async fn last_creation_size(
        &self,
        store_id: &str,
        object_key: &str,
    ) -> Result<Option<u64>, StoreError>;

    /// Sum of deltas timestamped in `[start, end)`, optionally for one store.
    /// `None` if no record falls in the range.
    async fn window_sum(
        &self,
        store_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError>;
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<DeltaLogRecord>,
    seen: HashSet<Uuid>,
}

/// In-process delta log; offset is the index into the entry list
#[derive(Debug, Default)]
pub struct MemoryDeltaLog {
    state: Mutex<LogState>,
}

impl MemoryDeltaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeltaLog for MemoryDeltaLog {
    async fn append(&self, record: &DeltaLogRecord) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock();
        if !state.seen.insert(record.event_id) {
            return Ok(None);
        }
        state.entries.push(record.clone());
        Ok(Some((state.entries.len() - 1) as u64))
    }

    async fn read_from(&self, offset: u64, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let state = self.state.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);

        Ok(state
            .entries
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(i, record)| LogEntry {
                offset: i as u64,
                record: record.clone(),
            })
            .collect())
    }

    async fn last_creation_size(
        &self,
        store_id: &str,
        object_key: &str,
    ) -> Result<Option<u64>, StoreError> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .rev()
            .find(|r| r.store_id == store_id && r.object_key == object_key && r.size_delta > 0)
            .map(|r| r.size_delta.unsigned_abs()))
    }

    async fn window_sum(
        &self,
        store_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .filter(|r| store_id.map_or(true, |store| r.store_id == store))
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .fold(None, |sum: Option<i64>, r| {
                Some(sum.unwrap_or(0).saturating_add(r.size_delta))
            }))
    }
}

/// Delta log in PostgreSQL, offsets from a `BIGSERIAL` column
pub struct PgDeltaLog {
    pool: PgPool,
}

impl PgDeltaLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &PgRow) -> Result<LogEntry, StoreError> {
    Ok(LogEntry {
        offset: from_db("offset_id", row.try_get("offset_id")?)?,
        record: DeltaLogRecord {
            event_id: row.try_get("event_id")?,
            store_id: row.try_get("store_id")?,
            object_key: row.try_get("object_key")?,
            size_delta: row.try_get("size_delta")?,
            timestamp: row.try_get("timestamp")?,
        },
    })
}

#[async_trait]
impl DeltaLog for PgDeltaLog {
    async fn append(&self, record: &DeltaLogRecord) -> Result<Option<u64>, StoreError> {
        let offset: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO delta_log (event_id, store_id, object_key, size_delta, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING offset_id
            "#,
        )
        .bind(record.event_id)
        .bind(&record.store_id)
        .bind(&record.object_key)
        .bind(record.size_delta)
        .bind(record.timestamp)
        .fetch_optional(&self.pool)
        .await?;

        if offset.is_none() {
            debug!(event_id = %record.event_id, "Delta already logged");
        }

        offset.map(|o| from_db("offset_id", o)).transpose()
    }

    async fn read_from(&self, offset: u64, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT offset_id, event_id, store_id, object_key, size_delta, timestamp
            FROM delta_log
            WHERE offset_id >= $1
            ORDER BY offset_id ASC
            LIMIT $2
            "#,
        )
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn last_creation_size(
        &self,
        store_id: &str,
        object_key: &str,
    ) -> Result<Option<u64>, StoreError> {
        let size: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT size_delta
            FROM delta_log
            WHERE store_id = $1 AND object_key = $2 AND size_delta > 0
            ORDER BY offset_id DESC
            LIMIT 1
            "#,
        )
        .bind(store_id)
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?;

        size.map(|s| from_db("size_delta", s)).transpose()
    }

    async fn window_sum(
        &self,
        store_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT LEAST(GREATEST(SUM(size_delta), -9223372036854775808), 9223372036854775807)::BIGINT
                       AS total,
                   COUNT(*) AS records
            FROM delta_log
            WHERE ($1::TEXT IS NULL OR store_id = $1)
              AND timestamp >= $2
              AND timestamp < $3
            "#,
        )
        .bind(store_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let records: i64 = row.try_get("records")?;
        if records == 0 {
            return Ok(None);
        }

        Ok(row.try_get("total")?)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tokio::time::Instant;
use tracing::{debug, error, instrument};
use usage_pipeline::{LifecycleEvent, Lease, QueueConfig, QueueError, QueueMessage, WorkQueue};
use uuid::Uuid;

/// Work queue persisted in the `work_queue` table.
///
/// Several processes may share one logical queue; leasing uses
/// `FOR UPDATE SKIP LOCKED` so each message has at most one holder.
pub struct PgQueue {
    pool: PgPool,
    name: String,
    config: QueueConfig,
}

impl PgQueue {
    pub fn new(pool: PgPool, name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            pool,
            name: name.into(),
            config,
        }
    }

    /// Return lapsed leases to the queue, dead-lettering exhausted messages
    async fn reclaim_expired(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET receive_count = receive_count + 1,
                lease_id = NULL,
                dead_lettered_at = CASE WHEN receive_count + 1 > $2 THEN NOW() ELSE NULL END
            WHERE queue_name = $1
              AND lease_id IS NOT NULL
              AND visible_at <= NOW()
              AND dead_lettered_at IS NULL
            RETURNING id, receive_count, dead_lettered_at IS NOT NULL AS dead
            "#,
        )
        .bind(&self.name)
        .bind(i32::try_from(self.config.max_receive_count).unwrap_or(i32::MAX))
        .fetch_all(&mut **tx)
        .await?;

        for row in rows {
            let message_id: Uuid = row.try_get("id")?;
            let receive_count: i32 = row.try_get("receive_count")?;
            if row.try_get::<bool, _>("dead")? {
                error!(
                    queue = %self.name,
                    message_id = %message_id,
                    receive_count = receive_count,
                    "Retry budget exhausted, moving message to dead-letter queue"
                );
                metrics::counter!("pipeline.queue.dead_lettered", "queue" => self.name.clone())
                    .increment(1);
            } else {
                debug!(
                    queue = %self.name,
                    message_id = %message_id,
                    receive_count = receive_count,
                    "Lease expired, message visible again"
                );
            }
        }

        Ok(())
    }

    async fn reclaim(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        self.reclaim_expired(&mut tx).await?;
        tx.commit().await
    }
}

/// Translate a wall-clock lease end into the runtime clock
fn to_instant(visible_at: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let remaining = (visible_at - now).to_std().unwrap_or_default();
    Instant::now() + remaining
}

fn message_from_row(row: &PgRow, leased: bool) -> Result<QueueMessage, sqlx::Error> {
    let Json(event): Json<LifecycleEvent> = row.try_get("payload")?;
    let receive_count: i32 = row.try_get("receive_count")?;
    let visibility_deadline = if leased {
        let visible_at: DateTime<Utc> = row.try_get("visible_at")?;
        Some(to_instant(visible_at, Utc::now()))
    } else {
        None
    };

    Ok(QueueMessage {
        message_id: row.try_get("id")?,
        event,
        receive_count: u32::try_from(receive_count).unwrap_or_default(),
        visibility_deadline,
    })
}

#[async_trait]
impl WorkQueue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, event: LifecycleEvent) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO work_queue (id, queue_name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(message_id)
        .bind(&self.name)
        .bind(Json(&event))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::EnqueueError(e.to_string()))?;

        Ok(message_id)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn receive(&self) -> Result<Option<Lease>, QueueError> {
        let receive_error = |e: sqlx::Error| QueueError::ReceiveError(e.to_string());
        let mut tx = self.pool.begin().await.map_err(receive_error)?;

        self.reclaim_expired(&mut tx).await.map_err(receive_error)?;

        let lease_id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE work_queue
            SET lease_id = $2,
                visible_at = NOW() + make_interval(secs => $3)
            WHERE id = (
                SELECT id FROM work_queue
                WHERE queue_name = $1
                  AND lease_id IS NULL
                  AND dead_lettered_at IS NULL
                ORDER BY enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, receive_count, visible_at
            "#,
        )
        .bind(&self.name)
        .bind(lease_id)
        .bind(self.config.visibility_timeout().as_secs_f64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(receive_error)?;

        let lease = row
            .map(|row| message_from_row(&row, true))
            .transpose()
            .map_err(receive_error)?
            .map(|message| Lease { lease_id, message });

        tx.commit().await.map_err(receive_error)?;
        Ok(lease)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM work_queue
            WHERE id = $1
              AND lease_id = $2
              AND visible_at > NOW()
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(lease.message.message_id)
        .bind(lease.lease_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::AckError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost {
                message_id: lease.message.message_id,
                lease_id: lease.lease_id,
            });
        }

        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let receive_error = |e: sqlx::Error| QueueError::ReceiveError(e.to_string());
        self.reclaim().await.map_err(receive_error)?;

        let rows = sqlx::query(
            r#"
            SELECT id, payload, receive_count
            FROM work_queue
            WHERE queue_name = $1 AND dead_lettered_at IS NOT NULL
            ORDER BY dead_lettered_at ASC
            "#,
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(receive_error)?;

        rows.iter()
            .map(|row| message_from_row(row, false))
            .collect::<Result<_, _>>()
            .map_err(receive_error)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let receive_error = |e: sqlx::Error| QueueError::ReceiveError(e.to_string());
        self.reclaim().await.map_err(receive_error)?;

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM work_queue WHERE queue_name = $1 AND dead_lettered_at IS NULL",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .map_err(receive_error)?;

        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_runtime_clock() {
        let now = Utc::now();
        let start = Instant::now();

        let deadline = to_instant(now + chrono::Duration::seconds(30), now);
        assert_eq!(deadline - start, Duration::from_secs(30));

        // A lease that already lapsed maps to the present
        let lapsed = to_instant(now - chrono::Duration::seconds(5), now);
        assert_eq!(lapsed, start);
    }
}

//! Outbox store gateway (C1): parameterized reads/updates on the outbox
//! table, encapsulating the "oldest-per-key unpublished" query and the
//! batch-update primitives.

use crate::error::{RelayError, RelayResult};
use crate::model::{OutboxRow, TERMINAL_FAILURE_RETRY_COUNT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resilience::{with_timeout_result, ServiceConfig};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Above this many ids, `MarkPublishedBatch`/`MarkReceivedBatch` split the
/// update into chunks instead of one parameterized IN list.
const CHUNKED_UPDATE_THRESHOLD: usize = 1_000;

/// Abstracts the outbox table so a test double can stand in for PostgreSQL.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn fetch_next_batch(&self, batch_size: i64) -> RelayResult<Vec<OutboxRow>>;
    async fn mark_published_batch(&self, ids: &[i64], now: DateTime<Utc>) -> RelayResult<()>;
    async fn mark_received_batch(&self, ids: &[i64], now: DateTime<Utc>) -> RelayResult<()>;
    async fn mark_failed(&self, id: i64, error_code: &str, max_retries: i32) -> RelayResult<()>;
}

/// PostgreSQL-backed implementation, bounded by a store-connection
/// semaphore sized to `databaseConnectionPoolSize`.
pub struct SqlxOutboxStore {
    pool: PgPool,
    semaphore: Arc<Semaphore>,
    resilience: ServiceConfig,
    require_processed_flag: bool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool, connection_pool_size: usize, require_processed_flag: bool) -> Self {
        Self {
            pool,
            semaphore: Arc::new(Semaphore::new(connection_pool_size.max(1))),
            resilience: resilience::database_config(),
            require_processed_flag,
        }
    }

    async fn with_permit<F, T>(&self, fut: F) -> RelayResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore never closed");

        with_timeout_result(self.resilience.timeout.duration, fut)
            .await
            .map_err(|e| match e {
                resilience::TimeoutError::Elapsed(d) => RelayError::QueryTimeout(d),
                resilience::TimeoutError::OperationFailed(msg) => {
                    RelayError::StoreUnavailable(sqlx::Error::Protocol(msg))
                }
            })
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn fetch_next_batch(&self, batch_size: i64) -> RelayResult<Vec<OutboxRow>> {
        let processed_clause = if self.require_processed_flag {
            "AND processed_flag = true"
        } else {
            ""
        };

        let query = format!(
            r#"
            SELECT DISTINCT ON (routing_key)
                id, routing_key, event_type, payload, publish_flag,
                processed_flag, produced_at, received_at, retry_count,
                error_code, created_at
            FROM (
                SELECT *
                FROM outbox
                WHERE publish_flag = false
                  AND retry_count >= 0
                  {processed_clause}
                ORDER BY routing_key, id
                FOR UPDATE SKIP LOCKED
            ) AS oldest_per_key
            ORDER BY routing_key, id
            LIMIT $1
            "#
        );

        let rows = self
            .with_permit(sqlx::query(&query).bind(batch_size).fetch_all(&self.pool))
            .await?;

        rows.into_iter().map(row_to_outbox_row).collect()
    }

    async fn mark_published_batch(&self, ids: &[i64], now: DateTime<Utc>) -> RelayResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mark_batch_column(ids, now, "publish_flag", "produced_at")
            .await
    }

    async fn mark_received_batch(&self, ids: &[i64], now: DateTime<Utc>) -> RelayResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mark_batch_timestamp_only(ids, now, "received_at")
            .await
    }

    async fn mark_failed(&self, id: i64, error_code: &str, max_retries: i32) -> RelayResult<()> {
        self.with_permit(async {
            let mut tx = self.pool.begin().await?;

            let retry_count: i32 = sqlx::query(
                "UPDATE outbox SET retry_count = retry_count + 1, error_code = $2
                 WHERE id = $1 RETURNING retry_count",
            )
            .bind(id)
            .bind(error_code)
            .fetch_one(&mut *tx)
            .await?
            .try_get("retry_count")?;

            if retry_count >= max_retries {
                sqlx::query("UPDATE outbox SET retry_count = $2 WHERE id = $1")
                    .bind(id)
                    .bind(TERMINAL_FAILURE_RETRY_COUNT)
                    .execute(&mut *tx)
                    .await?;
                warn!(row_id = id, "row exhausted retry budget, moved to terminal failure");
            }

            tx.commit().await
        })
        .await
    }
}

impl SqlxOutboxStore {
    async fn mark_batch_column(
        &self,
        ids: &[i64],
        now: DateTime<Utc>,
        flag_col: &str,
        ts_col: &str,
    ) -> RelayResult<()> {
        self.with_permit(async {
            let mut tx = self.pool.begin().await?;
            for chunk in ids.chunks(CHUNKED_UPDATE_THRESHOLD) {
                let query = format!(
                    "UPDATE outbox SET {flag_col} = true, {ts_col} = $2 WHERE id = ANY($1)"
                );
                sqlx::query(&query)
                    .bind(chunk)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            debug!(count = ids.len(), "batch marked via {}", flag_col);
            Ok(())
        })
        .await
    }

    async fn mark_batch_timestamp_only(
        &self,
        ids: &[i64],
        now: DateTime<Utc>,
        ts_col: &str,
    ) -> RelayResult<()> {
        self.with_permit(async {
            let mut tx = self.pool.begin().await?;
            for chunk in ids.chunks(CHUNKED_UPDATE_THRESHOLD) {
                let query = format!("UPDATE outbox SET {ts_col} = $2 WHERE id = ANY($1)");
                sqlx::query(&query)
                    .bind(chunk)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            debug!(count = ids.len(), "batch marked via {}", ts_col);
            Ok(())
        })
        .await
    }
}

fn row_to_outbox_row(row: sqlx::postgres::PgRow) -> RelayResult<OutboxRow> {
    Ok(OutboxRow {
        id: row.try_get("id")?,
        routing_key: row.try_get("routing_key")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        publish_flag: row.try_get("publish_flag")?,
        processed_flag: row.try_get("processed_flag")?,
        produced_at: row.try_get("produced_at")?,
        received_at: row.try_get("received_at")?,
        retry_count: row.try_get("retry_count")?,
        error_code: row.try_get("error_code")?,
        created_at: row.try_get("created_at")?,
    })
}

//! PostgreSQL-backed work queue.
//!
//! Items live in `export_work_items`. Workers claim them with
//! `FOR UPDATE SKIP LOCKED`, so any number of workers can poll concurrently
//! without handing the same item out twice.

use std::time::Duration;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::PgPool;
use tracing::{debug, instrument, warn};

use bulkport_core::{JobId, WorkItem};
use bulkport_storage::{StorageError, WorkQueue};

use crate::error::db_err;

/// A work item handed to a worker, with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub id: i64,
    pub attempts: i32,
    pub item: WorkItem,
}

#[derive(Debug, Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claims the oldest runnable item, if any.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<ClaimedItem>, StorageError> {
        let row = query(
            "UPDATE export_work_items SET state = 'running', attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM export_work_items \
                 WHERE state = 'available' AND run_at <= NOW() \
                 ORDER BY run_at, id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING id, attempts, payload",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: serde_json::Value = row.try_get("payload").map_err(db_err)?;
        let item: WorkItem = serde_json::from_value(payload)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        Ok(Some(ClaimedItem {
            id: row.try_get("id").map_err(db_err)?,
            attempts: row.try_get("attempts").map_err(db_err)?,
            item,
        }))
    }

    /// Removes an item a worker finished.
    pub async fn complete(&self, id: i64) -> Result<(), StorageError> {
        query("DELETE FROM export_work_items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Hands a claimed item back for another attempt after `delay`.
    ///
    /// Workers call this when the referenced job is not yet visible. Items
    /// that used up their attempts are marked `discarded` instead.
    pub async fn release(&self, id: i64, delay: Duration) -> Result<(), StorageError> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let row = query(
            "UPDATE export_work_items \
             SET state = CASE WHEN attempts >= max_attempts THEN 'discarded' ELSE 'available' END, \
                 run_at = NOW() + make_interval(secs => $2::double precision / 1000) \
             WHERE id = $1 \
             RETURNING state",
        )
        .bind(id)
        .bind(delay_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            let state: String = row.try_get("state").map_err(db_err)?;
            if state == "discarded" {
                warn!(work_item_id = id, "Work item exhausted its attempts");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    #[instrument(skip(self, item), fields(job_id = %item.job_id, resource_type = %item.resource_type))]
    async fn enqueue(&self, item: WorkItem) -> Result<(), StorageError> {
        let payload =
            serde_json::to_value(&item).map_err(|e| StorageError::serialization(e.to_string()))?;

        query(
            "INSERT INTO export_work_items (job_id, resource_type, payload) \
             VALUES ($1, $2, $3)",
        )
        .bind(item.job_id.as_uuid())
        .bind(&item.resource_type)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn discard_job(&self, job_id: JobId) -> Result<u64, StorageError> {
        let result = query(
            "DELETE FROM export_work_items WHERE job_id = $1 AND state = 'available'",
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(job_id = %job_id, removed = result.rows_affected(), "Discarded queued work items");
        Ok(result.rows_affected())
    }
}

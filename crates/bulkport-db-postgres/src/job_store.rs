//! PostgreSQL implementation of [`JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgRow};
use time::OffsetDateTime;
use tracing::{debug, instrument};
use uuid::Uuid;

use bulkport_core::{Job, JobArtifact, JobId, JobStatus, NewJob};
use bulkport_storage::{Admission, AdmissionCheck, JobStore, StorageError};

use crate::error::{PG_FOREIGN_KEY_VIOLATION, PG_LOCK_NOT_AVAILABLE, db_err, has_pg_error_code};

const JOB_COLUMNS: &str = "id, tenant_id, request_url, status, job_count, completed_job_count, \
     transaction_time, published, created_at, updated_at";

/// Job store backed by the `export_jobs` and `export_job_artifacts` tables.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    admission_lock_timeout_ms: u64,
}

impl PostgresJobStore {
    /// Creates a store whose admissions wait indefinitely for the tenant lock.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            admission_lock_timeout_ms: 0,
        }
    }

    #[must_use]
    pub fn with_admission_lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.admission_lock_timeout_ms = timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn job_exists(&self, id: JobId) -> Result<bool, StorageError> {
        let row = query("SELECT 1 FROM export_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }
}

fn time_to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_default()
}

fn chrono_to_time(dt: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(dt.timestamp()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(i64::from(dt.timestamp_subsec_nanos()))
}

fn row_to_job(row: &PgRow) -> Result<Job, StorageError> {
    let id: Uuid = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let job_count: Option<i32> = row.try_get("job_count").map_err(db_err)?;
    let completed: i32 = row.try_get("completed_job_count").map_err(db_err)?;
    let transaction_time: Option<DateTime<Utc>> =
        row.try_get("transaction_time").map_err(db_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(db_err)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        request_url: row.try_get("request_url").map_err(db_err)?,
        status: status.parse::<JobStatus>()?,
        job_count: job_count.map(|c| c.max(0) as u32),
        completed_job_count: completed.max(0) as u32,
        transaction_time: transaction_time.map(chrono_to_time),
        published: row.try_get("published").map_err(db_err)?,
        created_at: chrono_to_time(created_at),
        updated_at: chrono_to_time(updated_at),
    })
}

fn count_to_i32(count: u32) -> Result<i32, StorageError> {
    i32::try_from(count).map_err(|_| StorageError::internal(format!("job count {count} too large")))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job, check), fields(tenant_id = %job.tenant_id, job_id = %job.id))]
    async fn create_job(
        &self,
        job: NewJob,
        check: &dyn AdmissionCheck,
    ) -> Result<Admission, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if self.admission_lock_timeout_ms > 0 {
            // SET takes no bind parameters; the value is an integer.
            query(&format!(
                "SET LOCAL lock_timeout = {}",
                self.admission_lock_timeout_ms
            ))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        // Serializes check-and-insert per tenant until commit or rollback.
        query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&job.tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if has_pg_error_code(&e, PG_LOCK_NOT_AVAILABLE) {
                    StorageError::transaction_error(format!(
                        "timed out waiting for the admission lock of tenant {}",
                        job.tenant_id
                    ))
                } else {
                    db_err(e)
                }
            })?;

        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM export_jobs \
             WHERE tenant_id = $1 AND status IN ('Pending', 'In Progress')"
        ))
        .bind(&job.tenant_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let active = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;

        if check.overlaps(&active, OffsetDateTime::now_utc()) {
            tx.rollback().await.map_err(db_err)?;
            debug!(active = active.len(), "Admission rejected");
            return Ok(Admission::Rejected);
        }

        let job = job.into_job();
        query(
            "INSERT INTO export_jobs \
             (id, tenant_id, request_url, status, published, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, FALSE, $5, $5)",
        )
        .bind(job.id.as_uuid())
        .bind(&job.tenant_id)
        .bind(&job.request_url)
        .bind(job.status.as_str())
        .bind(time_to_chrono(job.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Admission::Admitted(job))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let row = query(&format!("SELECT {JOB_COLUMNS} FROM export_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn active_jobs_for_tenant(&self, tenant_id: &str) -> Result<Vec<Job>, StorageError> {
        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM export_jobs \
             WHERE tenant_id = $1 AND status IN ('Pending', 'In Progress') \
             ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn jobs_for_tenant(
        &self,
        tenant_id: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, StorageError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM export_jobs \
             WHERE tenant_id = $1 AND published \
             AND (cardinality($2::text[]) = 0 OR status = ANY($2)) \
             ORDER BY created_at DESC"
        ))
        .bind(tenant_id)
        .bind(statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn unpublished_jobs_created_before(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError> {
        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM export_jobs \
             WHERE NOT published AND created_at < $1 \
             ORDER BY created_at"
        ))
        .bind(time_to_chrono(before))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn jobs_by_status_updated_before(
        &self,
        statuses: &[JobStatus],
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = query(&format!(
            "SELECT {JOB_COLUMNS} FROM export_jobs \
             WHERE status = ANY($1) AND updated_at < $2 \
             ORDER BY updated_at"
        ))
        .bind(statuses)
        .bind(time_to_chrono(before))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn record_plan(
        &self,
        id: JobId,
        job_count: u32,
        transaction_time: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let result = query(
            "UPDATE export_jobs \
             SET job_count = $2, transaction_time = $3, updated_at = NOW() \
             WHERE id = $1 AND job_count IS NULL",
        )
        .bind(id.as_uuid())
        .bind(count_to_i32(job_count)?)
        .bind(time_to_chrono(transaction_time))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return if self.job_exists(id).await? {
                Err(StorageError::conflict(format!("job count of {id} already set")))
            } else {
                Err(StorageError::not_found("job", id))
            };
        }
        Ok(())
    }

    async fn publish(&self, id: JobId) -> Result<(), StorageError> {
        let result = query("UPDATE export_jobs SET published = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("job", id));
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StorageError> {
        query("DELETE FROM export_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StorageError> {
        from.transition_to(to)?;

        let result = query(
            "UPDATE export_jobs SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.job_exists(id).await? {
            Ok(false)
        } else {
            Err(StorageError::not_found("job", id))
        }
    }

    async fn record_item_completed(&self, id: JobId) -> Result<(), StorageError> {
        let result = query(
            "UPDATE export_jobs \
             SET completed_job_count = completed_job_count + 1, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("job", id));
        }
        Ok(())
    }

    async fn add_artifact(&self, artifact: JobArtifact) -> Result<(), StorageError> {
        query(
            "INSERT INTO export_job_artifacts (job_id, resource_type, file_name) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (job_id, file_name) DO NOTHING",
        )
        .bind(artifact.job_id.as_uuid())
        .bind(&artifact.resource_type)
        .bind(&artifact.file_name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if has_pg_error_code(&e, PG_FOREIGN_KEY_VIOLATION) {
                StorageError::not_found("job", artifact.job_id)
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn list_artifacts(&self, id: JobId) -> Result<Vec<JobArtifact>, StorageError> {
        let rows = query(
            "SELECT resource_type, file_name FROM export_job_artifacts \
             WHERE job_id = $1 ORDER BY id",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(JobArtifact {
                    job_id: id,
                    resource_type: row.try_get("resource_type").map_err(db_err)?,
                    file_name: row.try_get("file_name").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_time_conversion_keeps_subseconds() {
        let t = datetime!(2024-05-06 07:08:09.123456 UTC);
        assert_eq!(chrono_to_time(time_to_chrono(t)), t);
    }

    #[test]
    fn test_count_to_i32_rejects_overflow() {
        assert_eq!(count_to_i32(7).unwrap(), 7);
        assert!(count_to_i32(u32::MAX).is_err());
    }
}

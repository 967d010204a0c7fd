//! Core storage traits for export jobs and their work queue.

use async_trait::async_trait;
use time::OffsetDateTime;

use bulkport_core::{Job, JobArtifact, JobId, JobStatus, NewJob, WorkItem};

use crate::error::StorageError;

/// Decides whether a tenant's live jobs block a new one.
///
/// Backends call this while holding their per-tenant admission lock, so the
/// decision and the insert that follows it cannot interleave with another
/// admission for the same tenant.
pub trait AdmissionCheck: Send + Sync {
    /// `active` holds every `Pending`/`InProgress` job of the tenant,
    /// including jobs that are not yet published.
    fn overlaps(&self, active: &[Job], now: OffsetDateTime) -> bool;
}

/// Admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

impl AdmissionCheck for AdmitAll {
    fn overlaps(&self, _active: &[Job], _now: OffsetDateTime) -> bool {
        false
    }
}

/// Outcome of [`JobStore::create_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The job row was written, unpublished.
    Admitted(Job),
    /// The admission check found an overlapping live job.
    Rejected,
}

/// Durable repository of jobs and their artifacts.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Writes `job` as `Pending` and unpublished if `check` admits it.
    ///
    /// The check and the insert are serialized per tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails; a rejection is not an error.
    async fn create_job(
        &self,
        job: NewJob,
        check: &dyn AdmissionCheck,
    ) -> Result<Admission, StorageError>;

    /// Reads a job by id, published or not.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// Returns the tenant's `Pending` and `InProgress` jobs.
    async fn active_jobs_for_tenant(&self, tenant_id: &str) -> Result<Vec<Job>, StorageError>;

    /// Returns the tenant's published jobs in any of `statuses`, newest
    /// first. An empty `statuses` matches every status.
    async fn jobs_for_tenant(
        &self,
        tenant_id: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, StorageError>;

    /// Returns unpublished jobs created before `before`.
    ///
    /// A job stays unpublished only while its admission is in flight, so an
    /// old one was left behind by a process that died mid-admission.
    async fn unpublished_jobs_created_before(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError>;

    /// Returns jobs in any of `statuses` whose `updated_at` is before `before`.
    async fn jobs_by_status_updated_before(
        &self,
        statuses: &[JobStatus],
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError>;

    /// Records the job count and transaction time of a freshly planned job.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the job count was already set
    /// and [`StorageError::NotFound`] if the job does not exist.
    async fn record_plan(
        &self,
        id: JobId,
        job_count: u32,
        transaction_time: OffsetDateTime,
    ) -> Result<(), StorageError>;

    /// Makes a job visible to status polling and downloads.
    async fn publish(&self, id: JobId) -> Result<(), StorageError>;

    /// Removes a job and its artifacts. Used to roll back a failed admission.
    async fn delete_job(&self, id: JobId) -> Result<(), StorageError>;

    /// Moves a job from `from` to `to`, bumping `updated_at`.
    ///
    /// Returns `Ok(false)` without writing when the stored status is no
    /// longer `from`, which makes concurrent transitions safe to race.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidTransition`] if `from -> to` is not an
    /// edge of the job state machine, and [`StorageError::NotFound`] if the
    /// job does not exist.
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StorageError>;

    /// Counts one finished work item against the job's `job_count`.
    async fn record_item_completed(&self, id: JobId) -> Result<(), StorageError>;

    /// Records an output or error file produced by a worker.
    async fn add_artifact(&self, artifact: JobArtifact) -> Result<(), StorageError>;

    /// Lists the artifacts recorded for a job.
    async fn list_artifacts(&self, id: JobId) -> Result<Vec<JobArtifact>, StorageError>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Durable, at-least-once queue consumed by export workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues a work item.
    async fn enqueue(&self, item: WorkItem) -> Result<(), StorageError>;

    /// Drops every queued item of a job, returning how many were removed.
    ///
    /// Items already picked up by a worker are not affected.
    async fn discard_job(&self, job_id: JobId) -> Result<u64, StorageError>;
}

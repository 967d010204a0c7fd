use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use bulkport_core::{Job, JobArtifact, JobId, JobStatus, NewJob};
use bulkport_storage::{Admission, AdmissionCheck, JobStore, StorageError};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    artifacts: HashMap<JobId, Vec<JobArtifact>>,
}

/// In-memory [`JobStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a job exactly as given, bypassing admission.
    ///
    /// Lets fixtures place jobs at arbitrary ages and states.
    pub async fn insert_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id, job);
    }

    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        job: NewJob,
        check: &dyn AdmissionCheck,
    ) -> Result<Admission, StorageError> {
        let mut state = self.state.write().await;

        let active: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == job.tenant_id && j.status.is_active())
            .cloned()
            .collect();

        if check.overlaps(&active, OffsetDateTime::now_utc()) {
            return Ok(Admission::Rejected);
        }

        let job = job.into_job();
        state.jobs.insert(job.id, job.clone());
        Ok(Admission::Admitted(job))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn active_jobs_for_tenant(&self, tenant_id: &str) -> Result<Vec<Job>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.status.is_active())
            .cloned()
            .collect())
    }

    async fn jobs_for_tenant(
        &self,
        tenant_id: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, StorageError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.published)
            .filter(|j| statuses.is_empty() || statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn unpublished_jobs_created_before(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| !j.published && j.created_at < before)
            .cloned()
            .collect())
    }

    async fn jobs_by_status_updated_before(
        &self,
        statuses: &[JobStatus],
        before: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status) && j.updated_at < before)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.updated_at);
        Ok(jobs)
    }

    async fn record_plan(
        &self,
        id: JobId,
        job_count: u32,
        transaction_time: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("job", id))?;

        if job.job_count.is_some() {
            return Err(StorageError::conflict(format!("job count of {id} already set")));
        }
        job.job_count = Some(job_count);
        job.transaction_time = Some(transaction_time);
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn publish(&self, id: JobId) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("job", id))?;
        job.published = true;
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.jobs.remove(&id);
        state.artifacts.remove(&id);
        Ok(())
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StorageError> {
        from.transition_to(to)?;

        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("job", id))?;

        if job.status != from {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn record_item_completed(&self, id: JobId) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("job", id))?;
        job.completed_job_count += 1;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn add_artifact(&self, artifact: JobArtifact) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&artifact.job_id) {
            return Err(StorageError::not_found("job", artifact.job_id));
        }
        state
            .artifacts
            .entry(artifact.job_id)
            .or_default()
            .push(artifact);
        Ok(())
    }

    async fn list_artifacts(&self, id: JobId) -> Result<Vec<JobArtifact>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

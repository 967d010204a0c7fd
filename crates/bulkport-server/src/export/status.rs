//! Job status polling, job listing, manifests, cancellation and file lookup.
//!
//! Retention is evaluated on every read: a `Completed` job whose
//! `updated_at` is past the retention window is reported gone even if the
//! sweeper has not archived it yet.

use std::path::{Path, PathBuf};

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, instrument, warn};

use bulkport_core::{CoreError, Job, JobArtifact, JobId, JobStatus};
use bulkport_storage::{DynJobStore, DynWorkQueue};

use super::error::ExportError;

pub const JOB_NOT_FOUND: &str = "Job not found";
pub const JOB_CANCELLED: &str = "Job has been cancelled.";
pub const JOB_NOT_CANCELLABLE: &str = "Job was not cancellable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
}

/// Final output of a completed export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(with = "time::serde::rfc3339")]
    pub transaction_time: OffsetDateTime,
    pub request: String,
    pub requires_access_token: bool,
    pub output: Vec<ManifestEntry>,
    pub error: Vec<ManifestEntry>,
    #[serde(rename = "jobID")]
    pub job_id: JobId,
}

/// A tenant's jobs as a FHIR `searchset` Bundle of `Task` resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsBundle {
    pub resource_type: &'static str,
    #[serde(rename = "type")]
    pub bundle_type: &'static str,
    pub total: usize,
    pub entry: Vec<JobsBundleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobsBundleEntry {
    pub resource: JobTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub resource_type: &'static str,
    pub identifier: Vec<TaskIdentifier>,
    pub status: &'static str,
    pub intent: &'static str,
    pub input: Vec<TaskInput>,
    pub execution_period: TaskPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskIdentifier {
    #[serde(rename = "use")]
    pub use_: &'static str,
    pub system: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    #[serde(rename = "type")]
    pub input_type: TaskInputType,
    pub value_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInputType {
    pub text: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl JobTask {
    /// `jobs_url` is the listing endpoint, used as the identifier system.
    fn from_job(job: &Job, jobs_url: &str) -> Self {
        Self {
            resource_type: "Task",
            identifier: vec![TaskIdentifier {
                use_: "official",
                system: jobs_url.to_string(),
                value: job.id.to_string(),
            }],
            status: task_status(job.status),
            intent: "order",
            input: vec![TaskInput {
                input_type: TaskInputType {
                    text: "BULK FHIR Export",
                },
                value_string: format!("GET {}", job.request_url),
            }],
            execution_period: TaskPeriod {
                start: job.created_at,
                end: job.updated_at,
            },
        }
    }
}

/// FHIR `Task.status` code for a job status. Task has no archived or
/// expired state, so those read as completed.
pub fn task_status(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "accepted",
        JobStatus::InProgress => "in-progress",
        JobStatus::Completed | JobStatus::Archived | JobStatus::Expired => "completed",
        JobStatus::Failed | JobStatus::FailedExpired => "failed",
        JobStatus::Cancelled | JobStatus::CancelledExpired => "cancelled",
    }
}

/// Parses the `_status` filter of a job listing: comma separated job
/// statuses, possibly repeated. No filter means every status.
pub fn parse_status_filter(query: &str) -> Result<Vec<JobStatus>, ExportError> {
    let mut statuses = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != "_status" {
            continue;
        }
        for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let status = raw.parse::<JobStatus>().map_err(|_| {
                ExportError::Validation(CoreError::malformed_query(format!(
                    "Invalid _status value {raw:?}"
                )))
            })?;
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }
    }
    Ok(statuses)
}

/// What a status poll reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusView {
    /// Still running; carries the `X-Progress` text.
    InProgress { progress: String },
    Completed {
        manifest: Manifest,
        expires: OffsetDateTime,
    },
}

pub struct StatusService {
    store: DynJobStore,
    queue: DynWorkQueue,
    retention: Duration,
    payload_dir: PathBuf,
}

impl StatusService {
    pub fn new(
        store: DynJobStore,
        queue: DynWorkQueue,
        retention: Duration,
        payload_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            queue,
            retention,
            payload_dir,
        }
    }

    /// Loads a job the tenant may see. Unpublished and foreign jobs are
    /// indistinguishable from missing ones.
    async fn visible_job(&self, id: JobId, tenant_id: &str) -> Result<Job, ExportError> {
        match self.store.get_job(id).await? {
            Some(job) if job.published && job.is_owned_by(tenant_id) => Ok(job),
            Some(job) if job.published => {
                debug!(job_id = %id, owner = %job.tenant_id, "Job requested by another tenant");
                Err(ExportError::not_found(JOB_NOT_FOUND))
            }
            _ => Err(ExportError::not_found(JOB_NOT_FOUND)),
        }
    }

    #[instrument(skip(self, base_url))]
    pub async fn get_status(
        &self,
        id: JobId,
        tenant_id: &str,
        base_url: &str,
    ) -> Result<StatusView, ExportError> {
        self.get_status_at(id, tenant_id, base_url, OffsetDateTime::now_utc())
            .await
    }

    pub async fn get_status_at(
        &self,
        id: JobId,
        tenant_id: &str,
        base_url: &str,
        now: OffsetDateTime,
    ) -> Result<StatusView, ExportError> {
        let job = self.visible_job(id, tenant_id).await?;
        let expires = job.expires_at(self.retention);

        match job.status {
            JobStatus::Pending | JobStatus::InProgress => Ok(StatusView::InProgress {
                progress: job.status_message(),
            }),
            JobStatus::Completed if job.is_past_retention(self.retention, now) => {
                Err(ExportError::gone("Job has expired", Some(expires)))
            }
            JobStatus::Completed => {
                let artifacts = self.store.list_artifacts(id).await?;
                let manifest = self.manifest(&job, &artifacts, base_url).await;
                Ok(StatusView::Completed { manifest, expires })
            }
            JobStatus::Archived | JobStatus::Expired => {
                Err(ExportError::gone("Job has expired", Some(expires)))
            }
            JobStatus::Failed | JobStatus::FailedExpired => Err(ExportError::JobFailed),
            JobStatus::Cancelled | JobStatus::CancelledExpired => {
                Err(ExportError::not_found(JOB_CANCELLED))
            }
        }
    }

    async fn manifest(&self, job: &Job, artifacts: &[JobArtifact], base_url: &str) -> Manifest {
        let base = base_url.trim_end_matches('/');
        let job_dir = self.payload_dir.join(job.id.to_string());

        let mut output = Vec::with_capacity(artifacts.len());
        let mut error = Vec::new();
        for artifact in artifacts.iter().filter(|a| !a.is_blank()) {
            output.push(ManifestEntry {
                resource_type: artifact.resource_type.clone(),
                url: data_url(base, job.id, &artifact.file_name),
            });

            let error_file = artifact.error_file_name();
            if file_exists(&job_dir.join(&error_file)).await {
                error.push(ManifestEntry {
                    resource_type: "OperationOutcome".to_string(),
                    url: data_url(base, job.id, &error_file),
                });
            }
        }

        Manifest {
            transaction_time: job.transaction_time.unwrap_or(job.created_at),
            request: job.request_url.clone(),
            requires_access_token: true,
            output,
            error,
            job_id: job.id,
        }
    }

    /// Lists the tenant's published jobs, newest first.
    ///
    /// An empty result is reported as not found.
    #[instrument(skip(self, jobs_url))]
    pub async fn list_jobs(
        &self,
        tenant_id: &str,
        statuses: &[JobStatus],
        jobs_url: &str,
    ) -> Result<JobsBundle, ExportError> {
        let jobs = self.store.jobs_for_tenant(tenant_id, statuses).await?;
        if jobs.is_empty() {
            return Err(ExportError::not_found("No jobs found"));
        }

        let entry: Vec<JobsBundleEntry> = jobs
            .iter()
            .map(|job| JobsBundleEntry {
                resource: JobTask::from_job(job, jobs_url),
            })
            .collect();
        Ok(JobsBundle {
            resource_type: "Bundle",
            bundle_type: "searchset",
            total: entry.len(),
            entry,
        })
    }

    /// Cancels a pending or running job and drops its queued work.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: JobId, tenant_id: &str) -> Result<(), ExportError> {
        // A worker may move the job between our read and the update; re-read
        // and retry while it stays cancellable.
        for _ in 0..3 {
            let job = self.visible_job(id, tenant_id).await?;
            if !job.status.can_transition_to(JobStatus::Cancelled) {
                return Err(ExportError::gone(JOB_NOT_CANCELLABLE, None));
            }
            if self
                .store
                .transition(id, job.status, JobStatus::Cancelled)
                .await?
            {
                match self.queue.discard_job(id).await {
                    Ok(removed) => info!(job_id = %id, removed, "Job cancelled"),
                    Err(e) => warn!(job_id = %id, error = %e, "Job cancelled; queued items kept"),
                }
                return Ok(());
            }
        }
        Err(ExportError::gone(JOB_NOT_CANCELLABLE, None))
    }

    /// Resolves a downloadable output file of a completed job.
    pub async fn data_file(
        &self,
        id: JobId,
        tenant_id: &str,
        file_name: &str,
    ) -> Result<PathBuf, ExportError> {
        if !is_plain_file_name(file_name) {
            return Err(ExportError::not_found("File not found"));
        }

        let job = self.visible_job(id, tenant_id).await?;
        if job.status != JobStatus::Completed
            || job.is_past_retention(self.retention, OffsetDateTime::now_utc())
        {
            return Err(ExportError::not_found("File not found"));
        }

        let path = self.payload_dir.join(id.to_string()).join(file_name);
        if !file_exists(&path).await {
            return Err(ExportError::not_found("File not found"));
        }
        Ok(path)
    }
}

fn data_url(base: &str, id: JobId, file_name: &str) -> String {
    format!("{base}/data/{id}/{file_name}")
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

//! Export job records and the job status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// File name workers record for a work item that produced no output.
pub const BLANK_FILE_NAME: &str = "blank.ndjson";

/// Opaque, externally visible job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of an export job.
///
/// ```text
/// Pending ──> InProgress ──> Completed ──> Archived ──> Expired
///    │             │    └──> Failed ──> FailedExpired
///    └─────────────┴──> Cancelled ──> CancelledExpired
/// ```
///
/// Every edge moves forward; [`JobStatus::can_transition_to`] is the only
/// authority on which moves are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failed,
    FailedExpired,
    Archived,
    Expired,
    Cancelled,
    CancelledExpired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::FailedExpired,
        JobStatus::Archived,
        JobStatus::Expired,
        JobStatus::Cancelled,
        JobStatus::CancelledExpired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::FailedExpired => "FailedExpired",
            Self::Archived => "Archived",
            Self::Expired => "Expired",
            Self::Cancelled => "Cancelled",
            Self::CancelledExpired => "CancelledExpired",
        }
    }

    /// Returns true if a job in this state still has work in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::FailedExpired | Self::CancelledExpired
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Completed, Archived)
                | (Failed, FailedExpired)
                | (Archived, Expired)
                | (Cancelled, CancelledExpired)
        )
    }

    /// Validates `self -> next`, returning the target status on success.
    pub fn transition_to(&self, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidStatus(s.to_string()))
    }
}

/// Fields supplied by the caller when a job row is first written.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub tenant_id: String,
    pub request_url: String,
    pub created_at: OffsetDateTime,
}

impl NewJob {
    pub fn new(tenant_id: impl Into<String>, request_url: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: tenant_id.into(),
            request_url: request_url.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    /// Materialises the row as stored: `Pending`, unpublished, no job count.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            tenant_id: self.tenant_id,
            request_url: self.request_url,
            status: JobStatus::Pending,
            job_count: None,
            completed_job_count: 0,
            transaction_time: None,
            published: false,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// One accepted export request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    pub request_url: String,
    pub status: JobStatus,
    /// Number of work items; written once, after planning.
    pub job_count: Option<u32>,
    /// Work items finished so far, maintained by workers.
    pub completed_job_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub transaction_time: Option<OffsetDateTime>,
    /// False while the job is still being admitted; unpublished jobs are
    /// invisible to status polling and downloads.
    pub published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Job {
    pub fn is_owned_by(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Progress text reported in the `X-Progress` header.
    pub fn status_message(&self) -> String {
        match (self.status, self.job_count) {
            (JobStatus::InProgress, Some(count)) if count > 0 => {
                let pct = (self.completed_job_count.min(count) as u64 * 100) / count as u64;
                format!("{} ({pct}%)", self.status)
            }
            (status, _) => status.to_string(),
        }
    }

    /// Instant at which the job's output stops being served.
    pub fn expires_at(&self, retention: Duration) -> OffsetDateTime {
        self.updated_at.saturating_add(retention)
    }

    /// Expiry is derived from `updated_at` and the clock, never from a
    /// background mutation having already happened.
    pub fn is_past_retention(&self, retention: Duration, now: OffsetDateTime) -> bool {
        self.expires_at(retention) < now
    }

    /// Returns true if the job has been alive longer than `timeout`.
    pub fn is_older_than(&self, timeout: Duration, now: OffsetDateTime) -> bool {
        self.created_at.saturating_add(timeout) < now
    }
}

/// One output (or error) file produced by a finished work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub job_id: JobId,
    pub resource_type: String,
    pub file_name: String,
}

impl JobArtifact {
    pub fn new(job_id: JobId, resource_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            job_id,
            resource_type: resource_type.into(),
            file_name: file_name.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        let name = self.file_name.trim();
        name.is_empty() || name == BLANK_FILE_NAME
    }

    /// Name of the sibling file holding this artifact's error records.
    pub fn error_file_name(&self) -> String {
        let stem = self
            .file_name
            .strip_suffix(".ndjson")
            .unwrap_or(&self.file_name);
        format!("{stem}-error.ndjson")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn job(status: JobStatus) -> Job {
        let mut job = NewJob::new("tenant-a", "https://example.org/api/v1/Patient/$export")
            .created_at(datetime!(2024-01-01 00:00:00 UTC))
            .into_job();
        job.status = status;
        job
    }

    #[test]
    fn test_forward_edges_are_allowed() {
        use JobStatus::*;
        let edges = [
            (Pending, InProgress),
            (Pending, Cancelled),
            (InProgress, Completed),
            (InProgress, Failed),
            (InProgress, Cancelled),
            (Completed, Archived),
            (Failed, FailedExpired),
            (Archived, Expired),
            (Cancelled, CancelledExpired),
        ];
        for (from, to) in edges {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_no_edge_moves_backward() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if from.can_transition_to(to) {
                    assert!(
                        !to.can_transition_to(from),
                        "cycle between {from} and {to}"
                    );
                }
            }
        }
        assert!(JobStatus::Expired.transition_to(JobStatus::Completed).is_err());
        assert!(JobStatus::Completed.transition_to(JobStatus::Pending).is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(JobStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("Running".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"In Progress\""
        );
    }

    #[test]
    fn test_status_message_reports_percentage() {
        let mut job = job(JobStatus::InProgress);
        job.job_count = Some(25);
        job.completed_job_count = 6;
        assert_eq!(job.status_message(), "In Progress (24%)");

        job.job_count = Some(0);
        assert_eq!(job.status_message(), "In Progress");

        let pending = self::job(JobStatus::Pending);
        assert_eq!(pending.status_message(), "Pending");
    }

    #[test]
    fn test_retention_is_computed_from_updated_at() {
        let job = job(JobStatus::Completed);
        let retention = Duration::hours(24);
        assert_eq!(job.expires_at(retention), datetime!(2024-01-02 00:00:00 UTC));
        assert!(!job.is_past_retention(retention, datetime!(2024-01-01 23:00:00 UTC)));
        assert!(job.is_past_retention(retention, datetime!(2024-01-02 00:00:01 UTC)));
    }

    #[test]
    fn test_huge_durations_saturate_instead_of_overflowing() {
        let job = job(JobStatus::Completed);
        let now = datetime!(2024-01-02 00:00:00 UTC);
        assert!(!job.is_past_retention(Duration::hours(100_000_000), now));
        assert!(!job.is_older_than(Duration::MAX, now));
        assert!(job.is_older_than(Duration::hours(1), now));
    }

    #[test]
    fn test_error_file_name_and_blank_detection() {
        let id = JobId::new();
        let artifact = JobArtifact::new(id, "Patient", "a1b2.ndjson");
        assert_eq!(artifact.error_file_name(), "a1b2-error.ndjson");
        assert!(!artifact.is_blank());
        assert!(JobArtifact::new(id, "Patient", BLANK_FILE_NAME).is_blank());
        assert!(JobArtifact::new(id, "Patient", "  ").is_blank());
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("42".parse::<JobId>().is_err());
    }
}

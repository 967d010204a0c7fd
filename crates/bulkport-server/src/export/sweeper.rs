//! Archival and retirement of job output.
//!
//! Each pass selects jobs by status and `updated_at`, relocates or deletes
//! their per-job directory and then moves the status forward with a
//! conditional update. Passes are idempotent: a directory that is already
//! gone counts as done, so a run that moved files but failed to update the
//! status is completed by the next run. One job's failure never stops the
//! rest of the batch.
//!
//! A separate pass removes job rows that never got published: admission
//! publishes within seconds, so a row still unpublished after the job
//! timeout belongs to a process that died mid-admission.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use bulkport_core::{Job, JobId, JobStatus};
use bulkport_storage::{DynJobStore, DynWorkQueue, StorageError};

use crate::config::{AppConfig, ExportConfig, hours};

/// Selects which sweep passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SweepPass {
    /// `Completed` → `Archived`, moving payload to the archive directory.
    Archive,
    /// `Archived` → `Expired`, deleting archived output.
    Expire,
    /// `Failed` → `FailedExpired`.
    Failed,
    /// `Cancelled` → `CancelledExpired`.
    Cancelled,
    /// Deletes rows abandoned before publication.
    Unpublished,
    All,
}

impl SweepPass {
    fn includes(self, pass: SweepPass) -> bool {
        self == SweepPass::All || self == pass
    }
}

#[derive(Debug, Clone)]
pub struct SweepDirs {
    pub payload: PathBuf,
    pub archive: PathBuf,
    pub staging: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SweepThresholds {
    pub archive: Duration,
    pub expire: Duration,
    pub failed: Duration,
    pub cancelled: Duration,
    /// Age past which an unpublished row is abandoned; the job timeout.
    pub unpublished: Duration,
}

impl From<&AppConfig> for SweepThresholds {
    fn from(cfg: &AppConfig) -> Self {
        let s = &cfg.sweeper;
        Self {
            archive: hours(s.archive_threshold_hours),
            expire: hours(s.expire_threshold_hours),
            failed: hours(s.failed_threshold_hours),
            cancelled: hours(s.cancelled_threshold_hours),
            unpublished: cfg.export.job_timeout(),
        }
    }
}

impl From<&ExportConfig> for SweepDirs {
    fn from(cfg: &ExportConfig) -> Self {
        Self {
            payload: cfg.payload_dir.clone(),
            archive: cfg.archive_dir.clone(),
            staging: cfg.staging_dir.clone(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub archived: usize,
    pub expired: usize,
    pub failed_expired: usize,
    pub cancelled_expired: usize,
    pub unpublished_deleted: usize,
    pub failures: Vec<(JobId, String)>,
}

impl SweepReport {
    pub fn into_result(self) -> Result<SweepReport, SweepError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(SweepError {
                failures: self.failures,
            })
        }
    }
}

/// Aggregate of every per-job failure in a sweep.
#[derive(Debug, Error)]
#[error("{} job(s) failed to sweep: {}", .failures.len(), summarize(.failures))]
pub struct SweepError {
    pub failures: Vec<(JobId, String)>,
}

fn summarize(failures: &[(JobId, String)]) -> String {
    failures
        .iter()
        .map(|(id, e)| format!("{id}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
enum JobSweepError {
    #[error("filesystem: {0}")]
    Io(#[from] io::Error),
    #[error("store: {0}")]
    Store(#[from] StorageError),
}

pub struct Sweeper {
    store: DynJobStore,
    queue: DynWorkQueue,
    dirs: SweepDirs,
    thresholds: SweepThresholds,
}

impl Sweeper {
    pub fn new(
        store: DynJobStore,
        queue: DynWorkQueue,
        dirs: SweepDirs,
        thresholds: SweepThresholds,
    ) -> Self {
        Self {
            store,
            queue,
            dirs,
            thresholds,
        }
    }

    /// Runs the selected passes once.
    ///
    /// Only a failure to list jobs aborts a pass; per-job failures are
    /// collected in the report.
    #[instrument(skip(self))]
    pub async fn run(&self, pass: SweepPass) -> Result<SweepReport, StorageError> {
        self.run_at(pass, OffsetDateTime::now_utc()).await
    }

    pub async fn run_at(
        &self,
        pass: SweepPass,
        now: OffsetDateTime,
    ) -> Result<SweepReport, StorageError> {
        let mut report = SweepReport::default();

        if pass.includes(SweepPass::Archive) {
            for job in self.due(JobStatus::Completed, self.thresholds.archive, now).await? {
                match self.archive(&job).await {
                    Ok(true) => report.archived += 1,
                    Ok(false) => {}
                    Err(e) => report.failures.push((job.id, e.to_string())),
                }
            }
        }

        if pass.includes(SweepPass::Expire) {
            for job in self.due(JobStatus::Archived, self.thresholds.expire, now).await? {
                let dirs = [&self.dirs.archive, &self.dirs.staging];
                match self.retire(&job, JobStatus::Expired, &dirs).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(e) => report.failures.push((job.id, e.to_string())),
                }
            }
        }

        if pass.includes(SweepPass::Failed) {
            for job in self.due(JobStatus::Failed, self.thresholds.failed, now).await? {
                let dirs = [&self.dirs.staging, &self.dirs.payload];
                match self.retire(&job, JobStatus::FailedExpired, &dirs).await {
                    Ok(true) => report.failed_expired += 1,
                    Ok(false) => {}
                    Err(e) => report.failures.push((job.id, e.to_string())),
                }
            }
        }

        if pass.includes(SweepPass::Cancelled) {
            for job in self.due(JobStatus::Cancelled, self.thresholds.cancelled, now).await? {
                let dirs = [&self.dirs.staging, &self.dirs.payload];
                match self.retire(&job, JobStatus::CancelledExpired, &dirs).await {
                    Ok(true) => report.cancelled_expired += 1,
                    Ok(false) => {}
                    Err(e) => report.failures.push((job.id, e.to_string())),
                }
            }
        }

        if pass.includes(SweepPass::Unpublished) {
            let before = now.saturating_sub(self.thresholds.unpublished);
            for job in self.store.unpublished_jobs_created_before(before).await? {
                match self.delete_unpublished(&job).await {
                    Ok(()) => report.unpublished_deleted += 1,
                    Err(e) => report.failures.push((job.id, e.to_string())),
                }
            }
        }

        for (id, e) in &report.failures {
            error!(job_id = %id, error = %e, "Failed to sweep job");
        }
        info!(
            archived = report.archived,
            expired = report.expired,
            failed_expired = report.failed_expired,
            cancelled_expired = report.cancelled_expired,
            unpublished_deleted = report.unpublished_deleted,
            failures = report.failures.len(),
            "Sweep finished"
        );
        Ok(report)
    }

    async fn due(
        &self,
        status: JobStatus,
        threshold: Duration,
        now: OffsetDateTime,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self
            .store
            .jobs_by_status_updated_before(&[status], now.saturating_sub(threshold))
            .await?;
        if jobs.is_empty() {
            debug!(status = %status, "No jobs to sweep");
        }
        Ok(jobs)
    }

    /// Returns false when another sweep moved the job first.
    async fn archive(&self, job: &Job) -> Result<bool, JobSweepError> {
        let name = job.id.to_string();
        move_dir(&self.dirs.payload.join(&name), &self.dirs.archive.join(&name)).await?;

        let moved = self
            .store
            .transition(job.id, JobStatus::Completed, JobStatus::Archived)
            .await?;
        if moved {
            info!(job_id = %job.id, "Job output archived");
        }
        Ok(moved)
    }

    async fn retire(
        &self,
        job: &Job,
        to: JobStatus,
        roots: &[&PathBuf],
    ) -> Result<bool, JobSweepError> {
        let name = job.id.to_string();
        for root in roots {
            remove_dir(&root.join(&name)).await?;
        }

        let moved = self.store.transition(job.id, job.status, to).await?;
        if moved {
            info!(job_id = %job.id, status = %to, "Job files removed");
        }
        Ok(moved)
    }

    /// Drops an abandoned admission: its queued items, any files a worker
    /// already wrote, then the row itself.
    async fn delete_unpublished(&self, job: &Job) -> Result<(), JobSweepError> {
        let discarded = self.queue.discard_job(job.id).await?;
        let name = job.id.to_string();
        for root in [&self.dirs.staging, &self.dirs.payload] {
            remove_dir(&root.join(&name)).await?;
        }
        self.store.delete_job(job.id).await?;
        warn!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            discarded,
            "Deleted job abandoned before publication"
        );
        Ok(())
    }

    /// Sweeps every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run(SweepPass::All).await {
                    Ok(report) if !report.failures.is_empty() => {
                        warn!(failures = report.failures.len(), "Sweep finished with failures");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Sweep aborted"),
                }
            }
        })
    }
}

async fn remove_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Moves `from` to `to`. A missing source means the move already happened.
///
/// An existing `to` is never removed. If it already holds everything in
/// `from`, an earlier move got as far as copying and only the source is
/// left to delete; anything else is an error and both trees stay put.
async fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if !tokio::fs::try_exists(from).await? {
        return Ok(());
    }
    if tokio::fs::try_exists(to).await? {
        let (src, dst) = (from.to_path_buf(), to.to_path_buf());
        let complete = tokio::task::spawn_blocking(move || tree_contains(&dst, &src))
            .await
            .map_err(io::Error::other)??;
        if !complete {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and differs from {}", to.display(), from.display()),
            ));
        }
        debug!(from = %from.display(), "Removing source of an earlier copy");
        return remove_dir(from).await;
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            let (src, dst) = (from.to_path_buf(), to.to_path_buf());
            tokio::task::spawn_blocking(move || copy_into_place(&src, &dst))
                .await
                .map_err(io::Error::other)??;
            remove_dir(from).await
        }
        Err(e) => Err(e),
    }
}

/// Copies `from` to a sibling of `to`, checks the copy and renames it into
/// place, so `to` only ever appears complete.
fn copy_into_place(from: &Path, to: &Path) -> io::Result<()> {
    let mut partial = to.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    // A `.partial` tree is only ever an interrupted copy of ours.
    match std::fs::remove_dir_all(&partial) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    copy_tree(from, &partial)?;
    if !tree_contains(&partial, from)? {
        return Err(io::Error::other(format!(
            "copy of {} into {} is incomplete",
            from.display(),
            partial.display()
        )));
    }
    std::fs::rename(&partial, to)
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// True if `dir` holds every file of `expected` with the same size.
fn tree_contains(dir: &Path, expected: &Path) -> io::Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in std::fs::read_dir(expected)? {
        let entry = entry?;
        let candidate = dir.join(entry.file_name());
        let found = if entry.file_type()?.is_dir() {
            tree_contains(&candidate, &entry.path())?
        } else {
            match std::fs::metadata(&candidate) {
                Ok(meta) => meta.is_file() && meta.len() == entry.metadata()?.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e),
            }
        };
        if !found {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkport_core::{Cohort, NewJob, PlannedItem, WorkItem};
    use bulkport_db_memory::{InMemoryJobStore, InMemoryWorkQueue};
    use bulkport_storage::{JobStore, WorkQueue};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        dirs: SweepDirs,
        store: InMemoryJobStore,
        queue: InMemoryWorkQueue,
        sweeper: Sweeper,
    }

    fn fixture() -> Fixture {
        fixture_with(Duration::hours(24))
    }

    fn fixture_with(threshold: Duration) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let dirs = SweepDirs {
            payload: tmp.path().join("payload"),
            archive: tmp.path().join("archive"),
            staging: tmp.path().join("staging"),
        };
        let store = InMemoryJobStore::new();
        let queue = InMemoryWorkQueue::new();
        let thresholds = SweepThresholds {
            archive: threshold,
            expire: threshold,
            failed: threshold,
            cancelled: threshold,
            unpublished: threshold,
        };
        let sweeper = Sweeper::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            dirs.clone(),
            thresholds,
        );
        Fixture {
            _tmp: tmp,
            dirs,
            store,
            queue,
            sweeper,
        }
    }

    async fn seed(store: &InMemoryJobStore, status: JobStatus, age: Duration) -> Job {
        let now = OffsetDateTime::now_utc();
        let mut job = NewJob::new("tenant-a", "https://example.org/api/v1/Patient/$export")
            .created_at(now - age)
            .into_job();
        job.status = status;
        job.published = true;
        job.job_count = Some(1);
        store.insert_job(job.clone()).await;
        job
    }

    fn write_file(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), b"{}\n").unwrap();
    }

    async fn status(store: &InMemoryJobStore, id: JobId) -> JobStatus {
        store.get_job(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn archive_moves_payload_and_updates_status() {
        let f = fixture();
        let old = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;
        let fresh = seed(&f.store, JobStatus::Completed, Duration::hours(1)).await;
        write_file(&f.dirs.payload.join(old.id.to_string()), "a.ndjson");
        write_file(&f.dirs.payload.join(fresh.id.to_string()), "b.ndjson");

        let report = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(report.failures.is_empty());

        assert_eq!(status(&f.store, old.id).await, JobStatus::Archived);
        assert_eq!(status(&f.store, fresh.id).await, JobStatus::Completed);
        assert!(f.dirs.archive.join(old.id.to_string()).join("a.ndjson").exists());
        assert!(!f.dirs.payload.join(old.id.to_string()).exists());
        assert!(f.dirs.payload.join(fresh.id.to_string()).exists());
    }

    #[tokio::test]
    async fn archive_without_payload_still_archives() {
        let f = fixture();
        let job = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;

        let report = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(status(&f.store, job.id).await, JobStatus::Archived);
    }

    #[tokio::test]
    async fn archive_finishes_previously_moved_directory() {
        let f = fixture();
        let job = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;
        // A previous run moved the files but never updated the status.
        write_file(&f.dirs.archive.join(job.id.to_string()), "a.ndjson");

        f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(status(&f.store, job.id).await, JobStatus::Archived);
        assert!(f.dirs.archive.join(job.id.to_string()).join("a.ndjson").exists());
    }

    #[tokio::test]
    async fn expire_deletes_archive() {
        let f = fixture();
        let job = seed(&f.store, JobStatus::Archived, Duration::hours(30)).await;
        write_file(&f.dirs.archive.join(job.id.to_string()), "a.ndjson");

        let report = f.sweeper.run(SweepPass::Expire).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(status(&f.store, job.id).await, JobStatus::Expired);
        assert!(!f.dirs.archive.join(job.id.to_string()).exists());
    }

    #[tokio::test]
    async fn failed_and_cancelled_are_retired() {
        let f = fixture();
        let failed = seed(&f.store, JobStatus::Failed, Duration::hours(30)).await;
        let cancelled = seed(&f.store, JobStatus::Cancelled, Duration::hours(30)).await;
        write_file(&f.dirs.staging.join(failed.id.to_string()), "partial.ndjson");
        write_file(&f.dirs.payload.join(cancelled.id.to_string()), "a.ndjson");

        let report = f.sweeper.run(SweepPass::All).await.unwrap();
        assert_eq!(report.failed_expired, 1);
        assert_eq!(report.cancelled_expired, 1);
        assert_eq!(status(&f.store, failed.id).await, JobStatus::FailedExpired);
        assert_eq!(status(&f.store, cancelled.id).await, JobStatus::CancelledExpired);
        assert!(!f.dirs.staging.join(failed.id.to_string()).exists());
        assert!(!f.dirs.payload.join(cancelled.id.to_string()).exists());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let f = fixture();
        seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;

        let first = f.sweeper.run(SweepPass::Archive).await.unwrap();
        let second = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(first.archived, 1);
        assert_eq!(second.archived, 0);
        assert!(second.failures.is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let f = fixture();
        let bad = seed(&f.store, JobStatus::Completed, Duration::hours(31)).await;
        let good = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;
        write_file(&f.dirs.payload.join(bad.id.to_string()), "a.ndjson");
        write_file(&f.dirs.payload.join(good.id.to_string()), "b.ndjson");
        // A regular file squatting on the archive target cannot be replaced.
        std::fs::create_dir_all(&f.dirs.archive).unwrap();
        std::fs::write(f.dirs.archive.join(bad.id.to_string()), b"squatter").unwrap();

        let report = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, bad.id);

        assert_eq!(status(&f.store, bad.id).await, JobStatus::Completed);
        assert_eq!(status(&f.store, good.id).await, JobStatus::Archived);

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().starts_with("1 job(s) failed to sweep"));
    }

    #[tokio::test]
    async fn huge_threshold_selects_nothing() {
        let f = fixture_with(Duration::hours(100_000_000));
        let job = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;

        let report = f.sweeper.run(SweepPass::All).await.unwrap();
        assert_eq!(report.archived, 0);
        assert!(report.failures.is_empty());
        assert_eq!(status(&f.store, job.id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn archive_keeps_a_differing_target_and_the_source() {
        let f = fixture();
        let job = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;
        let name = job.id.to_string();
        write_file(&f.dirs.payload.join(&name), "a.ndjson");
        write_file(&f.dirs.archive.join(&name), "other.ndjson");

        let report = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(status(&f.store, job.id).await, JobStatus::Completed);
        assert!(f.dirs.payload.join(&name).join("a.ndjson").exists());
        assert!(f.dirs.archive.join(&name).join("other.ndjson").exists());
    }

    #[tokio::test]
    async fn archive_finishes_a_copy_that_left_the_source_behind() {
        let f = fixture();
        let job = seed(&f.store, JobStatus::Completed, Duration::hours(30)).await;
        let name = job.id.to_string();
        write_file(&f.dirs.payload.join(&name), "a.ndjson");
        write_file(&f.dirs.archive.join(&name), "a.ndjson");

        let report = f.sweeper.run(SweepPass::Archive).await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(report.failures.is_empty());
        assert!(!f.dirs.payload.join(&name).exists());
        assert!(f.dirs.archive.join(&name).join("a.ndjson").exists());
    }

    #[tokio::test]
    async fn unpublished_rows_past_the_job_timeout_are_deleted() {
        let f = fixture();
        let mut abandoned = NewJob::new("tenant-a", "https://example.org/api/v1/Patient/$export")
            .created_at(OffsetDateTime::now_utc() - Duration::hours(30))
            .into_job();
        abandoned.job_count = Some(1);
        f.store.insert_job(abandoned.clone()).await;
        let in_flight = NewJob::new("tenant-a", "https://example.org/api/v1/Patient/$export")
            .into_job();
        f.store.insert_job(in_flight.clone()).await;
        let published = seed(&f.store, JobStatus::Pending, Duration::hours(30)).await;

        f.queue
            .enqueue(WorkItem::from_plan(
                abandoned.id,
                "tenant-a",
                "v1",
                OffsetDateTime::now_utc(),
                PlannedItem {
                    resource_type: "Patient".into(),
                    since: None,
                    cohort: Cohort::Attributed,
                },
            ))
            .await
            .unwrap();
        write_file(&f.dirs.staging.join(abandoned.id.to_string()), "partial.ndjson");

        let report = f.sweeper.run(SweepPass::Unpublished).await.unwrap();
        assert_eq!(report.unpublished_deleted, 1);
        assert!(report.failures.is_empty());

        assert!(f.store.get_job(abandoned.id).await.unwrap().is_none());
        assert!(f.queue.is_empty().await);
        assert!(!f.dirs.staging.join(abandoned.id.to_string()).exists());
        assert!(f.store.get_job(in_flight.id).await.unwrap().is_some());
        assert!(f.store.get_job(published.id).await.unwrap().is_some());
    }

    #[test]
    fn copy_into_place_replaces_an_interrupted_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write_file(&src.join("nested"), "x.ndjson");
        write_file(&src, "y.ndjson");
        let dst = tmp.path().join("dst");
        write_file(&tmp.path().join("dst.partial"), "stale.ndjson");

        copy_into_place(&src, &dst).unwrap();
        assert!(dst.join("nested").join("x.ndjson").exists());
        assert!(dst.join("y.ndjson").exists());
        assert!(!dst.join("stale.ndjson").exists());
        assert!(!tmp.path().join("dst.partial").exists());
        assert!(src.join("y.ndjson").exists());
    }

    #[test]
    fn tree_contains_compares_names_and_sizes() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        write_file(&a.join("nested"), "x.ndjson");
        write_file(&b.join("nested"), "x.ndjson");
        write_file(&b, "extra.ndjson");
        assert!(tree_contains(&b, &a).unwrap());
        assert!(!tree_contains(&a, &b).unwrap());

        std::fs::write(b.join("nested").join("x.ndjson"), b"{}\n{}\n").unwrap();
        assert!(!tree_contains(&b, &a).unwrap());
    }

    #[tokio::test]
    async fn copy_tree_copies_nested_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write_file(&src.join("nested"), "x.ndjson");
        write_file(&src, "y.ndjson");

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("nested").join("x.ndjson").exists());
        assert!(dst.join("y.ndjson").exists());
    }
}

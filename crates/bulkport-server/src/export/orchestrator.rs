//! Job admission.
//!
//! A submission inserts the job unpublished, captures the transaction time,
//! records the work-item count, enqueues every item and only then publishes
//! the job. Any failure after the insert discards the queued items and
//! deletes the row, so clients never observe a half-admitted job.

use std::sync::Arc;

use time::Duration;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use bulkport_core::{ExportRequest, Job, JobId, NewJob, WorkItem, plan_work_items};
use bulkport_storage::{Admission, AdmissionCheck, AdmitAll, DynJobStore, DynWorkQueue};

use super::error::ExportError;
use super::guard::ConcurrencyGuard;
use super::watermark::WatermarkSource;

/// Admission policy applied by the orchestrator.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub job_timeout: Duration,
    pub retry_after_secs: u64,
    /// Tenants the concurrency guard applies to; `None` disables it.
    pub throttled: Option<ThrottleScope>,
}

#[derive(Debug, Clone)]
pub enum ThrottleScope {
    AllTenants,
    Tenants(Vec<String>),
}

impl AdmissionPolicy {
    fn throttles(&self, tenant_id: &str) -> bool {
        match &self.throttled {
            None => false,
            Some(ThrottleScope::AllTenants) => true,
            Some(ThrottleScope::Tenants(tenants)) => tenants.iter().any(|t| t == tenant_id),
        }
    }
}

impl From<&crate::config::ExportConfig> for AdmissionPolicy {
    fn from(cfg: &crate::config::ExportConfig) -> Self {
        let throttled = if cfg.tier == crate::config::Tier::Local {
            None
        } else if cfg.rate_limit.all {
            Some(ThrottleScope::AllTenants)
        } else {
            Some(ThrottleScope::Tenants(cfg.rate_limit.tenants.clone()))
        };
        Self {
            job_timeout: cfg.job_timeout(),
            retry_after_secs: cfg.retry_after_secs,
            throttled,
        }
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: DynJobStore,
    queue: DynWorkQueue,
    watermark: Arc<dyn WatermarkSource>,
    policy: AdmissionPolicy,
}

impl JobOrchestrator {
    pub fn new(
        store: DynJobStore,
        queue: DynWorkQueue,
        watermark: Arc<dyn WatermarkSource>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            watermark,
            policy,
        }
    }

    /// Admits an export and returns the published job.
    ///
    /// The work runs on its own task, so a client disconnecting mid-request
    /// cannot stop the saga between the insert and its rollback.
    pub async fn submit(
        &self,
        tenant_id: &str,
        request: ExportRequest,
        request_url: &str,
    ) -> Result<Job, ExportError> {
        let this = self.clone();
        let tenant_id = tenant_id.to_string();
        let request_url = request_url.to_string();
        let span = info_span!("export.submit", tenant_id = %tenant_id, version = %request.version);

        tokio::spawn(async move { this.run(&tenant_id, &request, &request_url).await }.instrument(span))
            .await
            .map_err(|e| ExportError::fatal(format!("submission task failed: {e}")))?
    }

    async fn run(
        &self,
        tenant_id: &str,
        request: &ExportRequest,
        request_url: &str,
    ) -> Result<Job, ExportError> {
        let guard;
        let check: &dyn AdmissionCheck = if self.policy.throttles(tenant_id) {
            guard = ConcurrencyGuard::new(request, request_url, self.policy.job_timeout);
            &guard
        } else {
            &AdmitAll
        };

        let job = match self
            .store
            .create_job(NewJob::new(tenant_id, request_url), check)
            .await?
        {
            Admission::Admitted(job) => job,
            Admission::Rejected => {
                info!("Export rejected: overlapping job in progress");
                return Err(ExportError::Throttled {
                    retry_after_secs: self.policy.retry_after_secs,
                });
            }
        };

        match self.complete(job, request).await {
            Ok(job) => {
                info!(job_id = %job.id, job_count = ?job.job_count, "Export job admitted");
                Ok(job)
            }
            Err((id, err)) => {
                self.rollback(id).await;
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn complete(
        &self,
        mut job: Job,
        request: &ExportRequest,
    ) -> Result<Job, (JobId, ExportError)> {
        let id = job.id;
        let fail = |e: ExportError| (id, e);

        let transaction_time = self
            .watermark
            .probe(&job.tenant_id)
            .await
            .map_err(|e| fail(e.into()))?;

        let items: Vec<WorkItem> = plan_work_items(&request.resource_types, request.since, request.kind)
            .into_iter()
            .map(|planned| {
                WorkItem::from_plan(id, &job.tenant_id, &request.version, transaction_time, planned)
            })
            .collect();
        let job_count = u32::try_from(items.len())
            .map_err(|_| fail(ExportError::fatal("too many work items")))?;

        self.store
            .record_plan(id, job_count, transaction_time)
            .await
            .map_err(|e| fail(e.into()))?;

        for item in items {
            self.queue.enqueue(item).await.map_err(|e| fail(e.into()))?;
        }

        self.store.publish(id).await.map_err(|e| fail(e.into()))?;

        job.job_count = Some(job_count);
        job.transaction_time = Some(transaction_time);
        job.published = true;
        Ok(job)
    }

    async fn rollback(&self, id: JobId) {
        match self.queue.discard_job(id).await {
            Ok(removed) => info!(job_id = %id, removed, "Discarded work items of failed admission"),
            Err(e) => warn!(job_id = %id, error = %e, "Failed to discard work items"),
        }
        if let Err(e) = self.store.delete_job(id).await {
            error!(job_id = %id, error = %e, "Failed to delete job of failed admission");
        }
    }
}

//! Concurrency guard: at most one live export per tenant, API version and
//! resource type.

use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use bulkport_core::request_url::unescape;
use bulkport_core::{ExportRequest, Job, parse_request_url};
use bulkport_storage::AdmissionCheck;

/// Decides whether a new request overlaps one of the tenant's live jobs.
///
/// Evaluated by the job store while admission is serialized for the tenant,
/// so the check and the insert cannot interleave with another admission.
#[derive(Debug)]
pub struct ConcurrencyGuard<'a> {
    request: &'a ExportRequest,
    request_url: String,
    job_timeout: Duration,
}

impl<'a> ConcurrencyGuard<'a> {
    pub fn new(request: &'a ExportRequest, request_url: &str, job_timeout: Duration) -> Self {
        Self {
            request,
            request_url: unescape(request_url),
            job_timeout,
        }
    }

    fn blocks(&self, job: &Job, now: OffsetDateTime) -> bool {
        // Abandoned jobs never block, whatever their URL looks like.
        if job.is_older_than(self.job_timeout, now) {
            debug!(job_id = %job.id, "Ignoring timed out job");
            return false;
        }

        if unescape(&job.request_url) == self.request_url {
            return true;
        }

        let info = match parse_request_url(&job.request_url) {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    "Live job has an unparsable request URL; treating it as requesting all types"
                );
                return true;
            }
        };

        if info.version != self.request.version {
            return false;
        }
        if self.request.requests_all_types() {
            return true;
        }
        match &info.resource_types {
            None => true,
            Some(types) => self.request.overlaps_types(types),
        }
    }
}

impl AdmissionCheck for ConcurrencyGuard<'_> {
    fn overlaps(&self, active: &[Job], now: OffsetDateTime) -> bool {
        active.iter().any(|job| self.blocks(job, now))
    }
}

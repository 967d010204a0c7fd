//! Work items: the units of an export handed to out-of-process workers.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::job::JobId;
use crate::request::ExportKind;

/// Beneficiary population a work item covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Attributed,
    NewlyAttributed,
    Runout,
}

/// A planned work item, before it is bound to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub resource_type: String,
    pub since: Option<OffsetDateTime>,
    pub cohort: Cohort,
}

/// Expands an export into its work items.
///
/// One item per resource type carrying `since`. A historical request adds,
/// per type, an item for newly attributed beneficiaries with no `since` so
/// their full history is retrieved.
pub fn plan_work_items(
    resource_types: &[String],
    since: Option<OffsetDateTime>,
    kind: ExportKind,
) -> Vec<PlannedItem> {
    let base_cohort = match kind {
        ExportKind::Runout => Cohort::Runout,
        ExportKind::Default | ExportKind::RetrieveNewBeneHistData => Cohort::Attributed,
    };

    let mut items = Vec::with_capacity(resource_types.len() * 2);
    for resource_type in resource_types {
        if kind.retrieves_history() {
            items.push(PlannedItem {
                resource_type: resource_type.clone(),
                since: None,
                cohort: Cohort::NewlyAttributed,
            });
        }
        items.push(PlannedItem {
            resource_type: resource_type.clone(),
            since,
            cohort: base_cohort,
        });
    }
    items
}

/// A work item as enqueued for workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub tenant_id: String,
    pub version: String,
    pub resource_type: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub transaction_time: OffsetDateTime,
    pub cohort: Cohort,
}

impl WorkItem {
    pub fn from_plan(
        job_id: JobId,
        tenant_id: &str,
        version: &str,
        transaction_time: OffsetDateTime,
        planned: PlannedItem,
    ) -> Self {
        Self {
            job_id,
            tenant_id: tenant_id.to_string(),
            version: version.to_string(),
            resource_type: planned.resource_type,
            since: planned.since,
            transaction_time,
            cohort: planned.cohort,
        }
    }
}

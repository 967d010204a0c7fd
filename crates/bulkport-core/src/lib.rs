//! # bulkport-core
//!
//! Domain types for asynchronous bulk data export.
//!
//! - [`RequestValidator`] normalizes `$export` query parameters into an
//!   [`ExportRequest`].
//! - [`Job`] and [`JobStatus`] model an accepted export and its lifecycle.
//! - [`plan_work_items`] expands a request into the work items handed to
//!   workers.
//!
//! ## Example
//!
//! ```ignore
//! use bulkport_core::prelude::*;
//!
//! let validator = RequestValidator::new(
//!     SupportedTypes::new().version("v1", ["Patient", "Coverage"]),
//! );
//! let request = validator.validate("v1", "_type=Patient&_since=2020-02-13T08:00:00Z")?;
//! let items = plan_work_items(&request.resource_types, request.since, request.kind);
//! ```

pub mod error;
pub mod job;
pub mod request;
pub mod request_url;
pub mod time;
pub mod work;

pub use error::{CoreError, ErrorCategory, Result};
pub use job::{BLANK_FILE_NAME, Job, JobArtifact, JobId, JobStatus, NewJob};
pub use request::{
    ExportKind, ExportRequest, GroupFeatures, OutputFormat, RequestValidator,
    SUPPORTED_OUTPUT_FORMATS, SupportedTypes,
};
pub use request_url::{RequestUrlInfo, api_version, parse_request_url};
pub use time::{Instant, format_rfc3339, now_utc, parse_instant};
pub use work::{Cohort, PlannedItem, WorkItem, plan_work_items};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{CoreError, ErrorCategory};
    pub use crate::job::{Job, JobArtifact, JobId, JobStatus, NewJob};
    pub use crate::request::{ExportKind, ExportRequest, RequestValidator, SupportedTypes};
    pub use crate::work::{Cohort, WorkItem, plan_work_items};
}

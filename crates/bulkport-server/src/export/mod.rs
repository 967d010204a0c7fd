//! Bulk `$export` orchestration: admission, status, cancellation and the
//! retention sweeper.

pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod routes;
pub mod status;
pub mod sweeper;
pub mod watermark;

pub use error::{ExportError, FAILED_JOB_MESSAGE};
pub use guard::ConcurrencyGuard;
pub use orchestrator::{AdmissionPolicy, JobOrchestrator, ThrottleScope};
pub use routes::export_routes;
pub use status::{JobsBundle, Manifest, ManifestEntry, StatusService, StatusView};
pub use sweeper::{SweepDirs, SweepError, SweepPass, SweepReport, SweepThresholds, Sweeper};
pub use watermark::{ClockWatermark, UpstreamWatermark, WatermarkError, WatermarkSource};

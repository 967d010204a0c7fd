//! # bulkport-storage
//!
//! Storage abstraction layer for bulk export jobs.
//!
//! This crate defines the traits every backend implements; implementations
//! live in `bulkport-db-memory` and `bulkport-db-postgres`.
//!
//! - [`JobStore`]: jobs, artifacts and serialized admission
//! - [`WorkQueue`]: the at-least-once queue workers consume
//!
//! ## Example
//!
//! ```ignore
//! use bulkport_storage::{Admission, AdmitAll, JobStore};
//!
//! async fn admit(store: &dyn JobStore, job: NewJob) -> Result<(), StorageError> {
//!     if let Admission::Admitted(job) = store.create_job(job, &AdmitAll).await? {
//!         store.publish(job.id).await?;
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod traits;

pub use error::{ErrorCategory, StorageError};
pub use traits::{Admission, AdmissionCheck, AdmitAll, JobStore, WorkQueue};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared job store trait object.
pub type DynJobStore = std::sync::Arc<dyn JobStore>;

/// Type alias for a shared work queue trait object.
pub type DynWorkQueue = std::sync::Arc<dyn WorkQueue>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::traits::{Admission, AdmissionCheck, AdmitAll, JobStore, WorkQueue};
    pub use crate::{DynJobStore, DynWorkQueue, StorageResult};
}

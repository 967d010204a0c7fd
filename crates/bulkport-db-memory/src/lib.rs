//! In-memory job store and work queue.
//!
//! Used by tests and by the `local` deployment tier, where no database is
//! configured. State lives behind `tokio::sync::RwLock`s; admission takes the
//! write lock for the whole check-and-insert, which serializes it across
//! tenants as well as within one.
//!
//! # Example
//!
//! ```ignore
//! use bulkport_db_memory::{InMemoryJobStore, InMemoryWorkQueue};
//!
//! let store = Arc::new(InMemoryJobStore::new());
//! let queue = Arc::new(InMemoryWorkQueue::new());
//! ```

mod queue;
mod store;

pub use queue::InMemoryWorkQueue;
pub use store::InMemoryJobStore;

pub use bulkport_storage::{JobStore, StorageError, WorkQueue};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use bulkport_core::{JobId, WorkItem};
use bulkport_storage::{StorageError, WorkQueue};

/// In-memory [`WorkQueue`] holding items in arrival order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkQueue {
    items: Arc<RwLock<Vec<WorkItem>>>,
    enqueued_total: Arc<AtomicU64>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently queued.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Items queued for one job.
    pub async fn items_for(&self, job_id: JobId) -> Vec<WorkItem> {
        self.items
            .read()
            .await
            .iter()
            .filter(|item| item.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Removes and returns the oldest item.
    pub async fn pop(&self) -> Option<WorkItem> {
        let mut items = self.items.write().await;
        if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        }
    }

    /// Total items ever enqueued, including discarded ones.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<(), StorageError> {
        self.items.write().await.push(item);
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn discard_job(&self, job_id: JobId) -> Result<u64, StorageError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| item.job_id != job_id);
        let removed = (before - items.len()) as u64;
        if removed > 0 {
            tracing::debug!(job_id = %job_id, removed, "Discarded queued work items");
        }
        Ok(removed)
    }
}

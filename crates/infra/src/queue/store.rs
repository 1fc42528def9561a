//! Work queue storage abstraction.

use std::sync::Arc;

use flightwork_core::{CoreError, WorkItemId};

use super::types::{NewWorkItem, QueueCounts, TierFilter, WorkItem};

/// Durable table of work items.
///
/// Every mutation is a single conditional state transition, so several
/// daemon processes can share one store without any in-process locking.
/// `claim_batch` carries the one hard guarantee: no two concurrent callers
/// ever receive the same item.
#[async_trait::async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Enqueue a new PENDING item.
    async fn enqueue(&self, request: NewWorkItem) -> Result<WorkItem, StoreError>;

    /// Get an item by ID.
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Count PENDING items admitted by `filter` that are eligible now.
    ///
    /// Items still waiting out a backoff or a scheduled start are left out,
    /// so they never count toward a backlog.
    async fn count_pending(&self, filter: &TierFilter) -> Result<u64, StoreError>;

    /// Count PROCESSING items.
    async fn count_processing(&self) -> Result<u64, StoreError>;

    /// Counts for every status.
    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Atomically claim up to `limit` eligible PENDING items.
    ///
    /// Claimed items are PROCESSING with `started_at` set on return.
    async fn claim_batch(
        &self,
        filter: &TierFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Mark an item COMPLETE and clear its last error.
    async fn record_success(&self, id: WorkItemId) -> Result<(), StoreError>;

    /// Record a failed attempt; backs off or parks the item per retry policy.
    async fn record_failure(&self, id: WorkItemId, error: &str) -> Result<WorkItem, StoreError>;

    /// Return PROCESSING items claimed longer than `older_than` ago to PENDING.
    async fn reset_stuck(&self, older_than: std::time::Duration) -> Result<u64, StoreError>;

    /// Hand claimed items back untouched (rollback of a claim).
    async fn release_claims(&self, ids: &[WorkItemId]) -> Result<u64, StoreError>;

    /// List items parked after exhausting their retries, oldest first.
    async fn list_exhausted(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    /// Operator action: put a parked item back into the queue with a fresh budget.
    async fn requeue_exhausted(&self, id: WorkItemId) -> Result<WorkItem, StoreError>;

    /// Operator action: delete a parked item.
    async fn discard_exhausted(&self, id: WorkItemId) -> Result<(), StoreError>;
}

/// Work queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Connectivity or timeout; the next cycle retries.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("work item not found: {0}")]
    NotFound(WorkItemId),
    /// The item is no longer in the status the operation requires.
    #[error("stale claim on {id}: {detail}")]
    StaleClaim { id: WorkItemId, detail: String },
    /// Misconfiguration (missing table, bad identifier, no connection).
    #[error("store configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Errors no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Configuration(_))
    }

    pub(crate) fn stale(id: WorkItemId, err: CoreError) -> Self {
        StoreError::StaleClaim {
            id,
            detail: err.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl<T: WorkQueueStore + ?Sized> WorkQueueStore for Arc<T> {
    async fn enqueue(&self, request: NewWorkItem) -> Result<WorkItem, StoreError> {
        (**self).enqueue(request).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        (**self).get(id).await
    }

    async fn count_pending(&self, filter: &TierFilter) -> Result<u64, StoreError> {
        (**self).count_pending(filter).await
    }

    async fn count_processing(&self) -> Result<u64, StoreError> {
        (**self).count_processing().await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        (**self).counts().await
    }

    async fn claim_batch(
        &self,
        filter: &TierFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        (**self).claim_batch(filter, limit).await
    }

    async fn record_success(&self, id: WorkItemId) -> Result<(), StoreError> {
        (**self).record_success(id).await
    }

    async fn record_failure(&self, id: WorkItemId, error: &str) -> Result<WorkItem, StoreError> {
        (**self).record_failure(id, error).await
    }

    async fn reset_stuck(&self, older_than: std::time::Duration) -> Result<u64, StoreError> {
        (**self).reset_stuck(older_than).await
    }

    async fn release_claims(&self, ids: &[WorkItemId]) -> Result<u64, StoreError> {
        (**self).release_claims(ids).await
    }

    async fn list_exhausted(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        (**self).list_exhausted(limit).await
    }

    async fn requeue_exhausted(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        (**self).requeue_exhausted(id).await
    }

    async fn discard_exhausted(&self, id: WorkItemId) -> Result<(), StoreError> {
        (**self).discard_exhausted(id).await
    }
}

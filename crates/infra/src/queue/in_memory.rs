//! In-memory work queue store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flightwork_core::{Clock, SystemClock, WorkItemId};

use super::store::{StoreError, WorkQueueStore};
use super::types::{NewWorkItem, QueueCounts, RetryPolicy, TierFilter, WorkItem, WorkStatus};

/// In-memory work queue.
///
/// Every operation runs under one write lock, which makes each of them the
/// same atomic conditional transition the SQL store performs per row.
#[derive(Debug)]
pub struct InMemoryWorkQueueStore {
    items: RwLock<HashMap<WorkItemId, WorkItem>>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkQueueStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn arc(policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Snapshot of every item, for assertions.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let items = self.items.read().unwrap();
        let mut all: Vec<_> = items.values().cloned().collect();
        all.sort_by_key(|i| (i.queued_at, i.id));
        all
    }
}

impl Default for InMemoryWorkQueueStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait::async_trait]
impl WorkQueueStore for InMemoryWorkQueueStore {
    async fn enqueue(&self, request: NewWorkItem) -> Result<WorkItem, StoreError> {
        let item = WorkItem::new(request, self.clock.now());
        let mut items = self.items.write().unwrap();
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.items.read().unwrap().get(&id).cloned())
    }

    async fn count_pending(&self, filter: &TierFilter) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let items = self.items.read().unwrap();
        Ok(items
            .values()
            .filter(|i| i.is_claimable(now, filter))
            .count() as u64)
    }

    async fn count_processing(&self) -> Result<u64, StoreError> {
        let items = self.items.read().unwrap();
        Ok(items
            .values()
            .filter(|i| i.status == WorkStatus::Processing)
            .count() as u64)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let items = self.items.read().unwrap();
        let mut counts = QueueCounts::default();
        for item in items.values() {
            match item.status {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::Processing => counts.processing += 1,
                WorkStatus::Complete => counts.complete += 1,
                WorkStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn claim_batch(
        &self,
        filter: &TierFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut items = self.items.write().unwrap();

        // Most urgent tier first, then oldest first
        let mut candidates: Vec<_> = items
            .values()
            .filter(|i| i.is_claimable(now, filter))
            .map(|i| (i.tier.map_or(0, |t| t.value()), i.queued_at, i.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(item) = items.get_mut(&id) {
                // Conditional: only succeeds if still PENDING.
                if item.mark_claimed(now).is_ok() {
                    claimed.push(item.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn record_success(&self, id: WorkItemId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().unwrap();
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.mark_complete(now)
            .map_err(|e| StoreError::stale(id, e))
    }

    async fn record_failure(&self, id: WorkItemId, error: &str) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().unwrap();
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.mark_failed(error, now, &self.policy)
            .map_err(|e| StoreError::stale(id, e))?;
        Ok(item.clone())
    }

    async fn reset_stuck(&self, older_than: std::time::Duration) -> Result<u64, StoreError> {
        let lease = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::Configuration(format!("lease timeout out of range: {e}")))?;
        let cutoff = self.clock.now() - lease;

        let mut items = self.items.write().unwrap();
        let mut recovered = 0;
        for item in items.values_mut().filter(|i| i.lease_expired(cutoff)) {
            if item.mark_unclaimed().is_ok() {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn release_claims(&self, ids: &[WorkItemId]) -> Result<u64, StoreError> {
        let mut items = self.items.write().unwrap();
        let mut released = 0;
        for id in ids {
            if let Some(item) = items.get_mut(id) {
                if item.mark_unclaimed().is_ok() {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn list_exhausted(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.items.read().unwrap();
        let mut result: Vec<_> = items
            .values()
            .filter(|i| i.status == WorkStatus::Failed)
            .cloned()
            .collect();

        result.sort_by_key(|i| (i.completed_at, i.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_exhausted(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().unwrap();
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.mark_requeued(now)
            .map_err(|e| StoreError::stale(id, e))?;
        Ok(item.clone())
    }

    async fn discard_exhausted(&self, id: WorkItemId) -> Result<(), StoreError> {
        let mut items = self.items.write().unwrap();
        let status = items
            .get(&id)
            .map(|item| item.status)
            .ok_or(StoreError::NotFound(id))?;
        if status != WorkStatus::Failed {
            return Err(StoreError::StaleClaim {
                id,
                detail: format!("only failed items can be discarded, found {status}"),
            });
        }
        items.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::Utc;
    use flightwork_core::{ManualClock, SubjectRef, Tier};
    use proptest::prelude::*;

    fn flight(n: usize) -> NewWorkItem {
        NewWorkItem::new(SubjectRef::new(format!("flight-{n}")).unwrap())
    }

    fn store_with_clock(policy: RetryPolicy) -> (InMemoryWorkQueueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            InMemoryWorkQueueStore::with_clock(policy, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryWorkQueueStore::default();
        let item = store.enqueue(flight(1)).await.unwrap();

        let claimed = store.claim_batch(&TierFilter::Any, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, item.id);
        assert_eq!(claimed[0].status, WorkStatus::Processing);
        assert!(claimed[0].started_at.is_some());

        // Nothing left to claim
        assert!(store.claim_batch(&TierFilter::Any, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_items_wait_for_their_time() {
        let (store, clock) = store_with_clock(RetryPolicy::default());
        let later = clock.now() + chrono::Duration::minutes(5);
        store.enqueue(flight(1).eligible_at(later)).await.unwrap();

        assert!(store.claim_batch(&TierFilter::Any, 10).await.unwrap().is_empty());
        assert_eq!(store.count_pending(&TierFilter::Any).await.unwrap(), 0);
        assert_eq!(store.counts().await.unwrap().pending, 1);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(store.count_pending(&TierFilter::Any).await.unwrap(), 1);
        assert_eq!(store.claim_batch(&TierFilter::Any, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_prefers_urgent_tier_then_age() {
        let (store, clock) = store_with_clock(RetryPolicy::default());
        let slow = store.enqueue(flight(1).with_tier(Tier(3))).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let urgent = store.enqueue(flight(2).with_tier(Tier(0))).await.unwrap();

        let claimed = store.claim_batch(&TierFilter::Any, 1).await.unwrap();
        assert_eq!(claimed[0].id, urgent.id);

        let claimed = store.claim_batch(&TierFilter::Only(Tier(3)), 5).await.unwrap();
        assert_eq!(claimed[0].id, slow.id);
    }

    #[tokio::test]
    async fn failure_is_stale_unless_processing() {
        let store = InMemoryWorkQueueStore::default();
        let item = store.enqueue(flight(1)).await.unwrap();

        let err = store.record_failure(item.id, "boom").await.unwrap_err();
        assert!(matches!(err, StoreError::StaleClaim { .. }));

        let err = store.record_success(WorkItemId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn reset_stuck_respects_lease_boundary() {
        let (store, clock) = store_with_clock(RetryPolicy::default());
        let lease = Duration::from_secs(300);
        let item = store.enqueue(flight(1)).await.unwrap();
        store.claim_batch(&TierFilter::Any, 1).await.unwrap();

        clock.advance(chrono::Duration::seconds(299));
        assert_eq!(store.reset_stuck(lease).await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(store.reset_stuck(lease).await.unwrap(), 1);

        let recovered = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, WorkStatus::Pending);
        assert!(recovered.started_at.is_none());
        assert_eq!(recovered.retry_count, 0);
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let store = InMemoryWorkQueueStore::new(RetryPolicy::fixed(1, Duration::from_secs(1)));
        let item = store.enqueue(flight(1)).await.unwrap();

        store.claim_batch(&TierFilter::Any, 1).await.unwrap();
        let failed = store.record_failure(item.id, "unparseable route").await.unwrap();
        assert_eq!(failed.status, WorkStatus::Failed);

        // Parked items are never claimed again
        assert!(store.claim_batch(&TierFilter::Any, 10).await.unwrap().is_empty());

        let parked = store.list_exhausted(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, item.id);

        let requeued = store.requeue_exhausted(item.id).await.unwrap();
        assert_eq!(requeued.status, WorkStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(store.list_exhausted(10).await.unwrap().is_empty());

        // Only parked items can be discarded
        assert!(store.discard_exhausted(item.id).await.is_err());
    }

    #[tokio::test]
    async fn counts_tracking() {
        let store = InMemoryWorkQueueStore::default();
        for i in 0..5 {
            store.enqueue(flight(i)).await.unwrap();
        }

        let claimed = store.claim_batch(&TierFilter::Any, 2).await.unwrap();
        store.record_success(claimed[0].id).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.complete, 1);
        assert_eq!(store.count_processing().await.unwrap(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: concurrent claimants never receive the same item and
        /// never claim more than exists.
        #[test]
        fn concurrent_claims_are_disjoint(
            items in 0usize..200,
            claimants in 2usize..12,
            limit in 1usize..40,
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();

            let (claimed, total) = runtime.block_on(async move {
                let store = Arc::new(InMemoryWorkQueueStore::default());
                for i in 0..items {
                    store.enqueue(flight(i)).await.unwrap();
                }

                let mut handles = Vec::new();
                for _ in 0..claimants {
                    let store = store.clone();
                    handles.push(tokio::spawn(async move {
                        let mut mine = Vec::new();
                        loop {
                            let batch = store.claim_batch(&TierFilter::Any, limit).await.unwrap();
                            if batch.is_empty() {
                                break;
                            }
                            mine.extend(batch.into_iter().map(|i| i.id));
                        }
                        mine
                    }));
                }

                let mut claimed = Vec::new();
                for handle in handles {
                    claimed.extend(handle.await.unwrap());
                }
                (claimed, items)
            });

            let unique: HashSet<_> = claimed.iter().copied().collect();
            prop_assert_eq!(unique.len(), claimed.len());
            prop_assert!(claimed.len() <= total);
            prop_assert_eq!(claimed.len(), total);
        }

        /// Property: retry_count only grows on failure, and an exhausted
        /// item is never claimed again.
        #[test]
        fn retry_count_is_monotonic_until_exhaustion(
            max_retries in 1u32..6,
            outcomes in prop::collection::vec(any::<bool>(), 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async move {
                let clock = Arc::new(ManualClock::new(Utc::now()));
                let store = InMemoryWorkQueueStore::with_clock(
                    RetryPolicy::fixed(max_retries, Duration::from_secs(1)),
                    clock.clone(),
                );
                let item = store.enqueue(flight(0)).await.unwrap();
                let mut last_retry = 0;

                for fail in outcomes {
                    clock.advance(chrono::Duration::hours(1));
                    let batch = store.claim_batch(&TierFilter::Any, 1).await.unwrap();
                    let current = store.get(item.id).await.unwrap().unwrap();

                    if current.status == WorkStatus::Failed {
                        assert!(batch.is_empty());
                        assert_eq!(current.retry_count, max_retries);
                        continue;
                    }
                    if current.status == WorkStatus::Complete {
                        assert!(batch.is_empty());
                        continue;
                    }

                    assert_eq!(batch.len(), 1);
                    if fail {
                        let after = store.record_failure(item.id, "err").await.unwrap();
                        assert_eq!(after.retry_count, last_retry + 1);
                        last_retry = after.retry_count;
                    } else {
                        store.record_success(item.id).await.unwrap();
                        let after = store.get(item.id).await.unwrap().unwrap();
                        assert_eq!(after.retry_count, last_retry);
                    }
                }
            });
        }
    }
}

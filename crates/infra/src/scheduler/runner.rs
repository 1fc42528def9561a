//! One scheduling cycle: recover, classify, then claim/process/record.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::queue::{StoreError, TierFilter, WorkItem, WorkQueueStore, WorkStatus};

use super::backlog::BacklogClassifier;
use super::delegate::{DelegateError, ItemOutcome, ProcessingDelegate};
use super::lease::LeaseRecovery;
use super::stats::CycleStats;
use super::SchedulerError;

/// Batch runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Items per claim when not backlogged
    pub batch_size: usize,
    /// Hard cap on claim rounds per cycle
    pub max_iterations: u32,
    pub backlog: BacklogClassifier,
    pub lease: LeaseRecovery,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_iterations: 10,
            backlog: BacklogClassifier::new(100, 2),
            lease: LeaseRecovery::new(std::time::Duration::from_secs(10 * 60)),
        }
    }
}

/// Drives the store and the delegate through one cycle at a time.
///
/// Holds no state across cycles besides its configuration; everything it
/// decides comes from what the store reports at the start of the cycle.
pub struct BatchRunner<S: WorkQueueStore, D: ProcessingDelegate> {
    queue: String,
    store: S,
    delegate: D,
    config: RunnerConfig,
}

impl<S: WorkQueueStore, D: ProcessingDelegate> BatchRunner<S, D> {
    pub fn new(queue: impl Into<String>, store: S, delegate: D, config: RunnerConfig) -> Self {
        Self {
            queue: queue.into(),
            store,
            delegate,
            config,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Change the baseline batch size.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<(), SchedulerError> {
        if batch_size == 0 {
            return Err(SchedulerError::InvalidSetting(
                "batch size must be positive".to_string(),
            ));
        }
        self.config.batch_size = batch_size;
        Ok(())
    }

    /// Run one cycle over the items `filter` admits.
    ///
    /// Transient store errors and delegate failures end the cycle early and
    /// are reported in `CycleStats::aborted`; only fatal errors are returned.
    pub async fn run_cycle(
        &self,
        cycle: u64,
        filter: &TierFilter,
    ) -> Result<CycleStats, SchedulerError> {
        let started = Instant::now();
        let mut stats = CycleStats::new(cycle);

        let outcome = self.drive(filter, &mut stats).await;
        stats.elapsed = started.elapsed();

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(
                    queue = %self.queue,
                    cycle,
                    error = %err,
                    processed = stats.processed,
                    "cycle aborted; retrying next cycle"
                );
                stats.aborted = Some(err.to_string());
            }
        }

        self.log_cycle(&stats);
        Ok(stats)
    }

    async fn drive(&self, filter: &TierFilter, stats: &mut CycleStats) -> Result<(), SchedulerError> {
        stats.recovered = self.config.lease.run(&self.queue, &self.store).await?;

        stats.pending_at_start = self.store.count_pending(filter).await?;
        stats.processing_at_start = self.store.count_processing().await?;
        if stats.pending_at_start == 0 && stats.processing_at_start == 0 {
            return Ok(());
        }

        let decision = self.config.backlog.decide(stats.pending_at_start);
        stats.backlogged = decision.backlogged;
        stats.multiplier = decision.multiplier;
        if decision.backlogged {
            info!(
                queue = %self.queue,
                pending = stats.pending_at_start,
                threshold = self.config.backlog.threshold(),
                multiplier = decision.multiplier,
                "backlog detected; escalating batch size"
            );
        }

        let limit = self
            .config
            .batch_size
            .saturating_mul(decision.multiplier as usize);

        for _ in 0..self.config.max_iterations {
            let batch = self.store.claim_batch(filter, limit).await?;
            if batch.is_empty() {
                break;
            }

            stats.batches += 1;
            stats.claimed += batch.len() as u64;
            debug!(queue = %self.queue, claimed = batch.len(), limit, "claimed batch");

            self.process_batch(&batch, stats).await?;

            // Short batch: nothing more is eligible this cycle.
            if batch.len() < limit {
                break;
            }
        }

        Ok(())
    }

    async fn process_batch(
        &self,
        batch: &[WorkItem],
        stats: &mut CycleStats,
    ) -> Result<(), SchedulerError> {
        let started = Instant::now();
        let result = self.delegate.process(batch).await;
        let measured = started.elapsed();

        let mut result = match result {
            Ok(result) => result,
            Err(DelegateError::Batch(msg)) => {
                warn!(
                    queue = %self.queue,
                    delegate = self.delegate.name(),
                    items = batch.len(),
                    error = %msg,
                    "delegate rejected batch; failing every item"
                );
                stats.delegate_time += measured;
                for item in batch {
                    self.record(item, ItemOutcome::Failed(msg.clone()), stats).await?;
                }
                return Ok(());
            }
            Err(err) => {
                // Hand the batch back untouched; the next cycle sees it again.
                let ids: Vec<_> = batch.iter().map(|i| i.id).collect();
                match self.store.release_claims(&ids).await {
                    Ok(released) => stats.released += released,
                    Err(release_err) => warn!(
                        queue = %self.queue,
                        error = %release_err,
                        "could not release claims; lease recovery will reclaim them"
                    ),
                }
                return Err(err.into());
            }
        };

        stats.delegate_time += result.elapsed.unwrap_or(measured);
        stats.affected += result.affected;

        for item in batch {
            let outcome = result.outcomes.remove(&item.id).unwrap_or_else(|| {
                ItemOutcome::Failed("delegate reported no outcome for item".to_string())
            });
            self.record(item, outcome, stats).await?;
        }

        if !result.outcomes.is_empty() {
            warn!(
                queue = %self.queue,
                unknown = result.outcomes.len(),
                "delegate reported outcomes for items outside the batch"
            );
        }
        Ok(())
    }

    async fn record(
        &self,
        item: &WorkItem,
        outcome: ItemOutcome,
        stats: &mut CycleStats,
    ) -> Result<(), SchedulerError> {
        let recorded = match outcome {
            ItemOutcome::Succeeded => self.store.record_success(item.id).await.map(|()| {
                stats.succeeded += 1;
            }),
            ItemOutcome::Failed(error) => {
                self.store
                    .record_failure(item.id, &error)
                    .await
                    .map(|after| {
                        stats.failed += 1;
                        if after.status == WorkStatus::Failed {
                            stats.exhausted += 1;
                            warn!(
                                queue = %self.queue,
                                item_id = %item.id,
                                subject = %item.subject_ref,
                                retries = after.retry_count,
                                error = %error,
                                "work item exhausted its retries"
                            );
                        } else {
                            debug!(
                                queue = %self.queue,
                                item_id = %item.id,
                                retries = after.retry_count,
                                next_eligible_at = %after.next_eligible_at,
                                error = %error,
                                "work item failed; backing off"
                            );
                        }
                    })
            }
        };

        match recorded {
            Ok(()) => {
                stats.processed += 1;
                Ok(())
            }
            // Someone else decided this item's fate (lease recovery, operator).
            Err(err @ (StoreError::StaleClaim { .. } | StoreError::NotFound(_))) => {
                warn!(queue = %self.queue, item_id = %item.id, error = %err, "outcome not recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn log_cycle(&self, stats: &CycleStats) {
        if stats.is_idle() && stats.recovered == 0 && stats.aborted.is_none() {
            debug!(
                queue = %self.queue,
                cycle = stats.cycle,
                pending = stats.pending_at_start,
                processing = stats.processing_at_start,
                "idle cycle"
            );
            return;
        }

        info!(
            queue = %self.queue,
            cycle = stats.cycle,
            pending = stats.pending_at_start,
            processing = stats.processing_at_start,
            recovered = stats.recovered,
            backlogged = stats.backlogged,
            multiplier = stats.multiplier,
            batches = stats.batches,
            claimed = stats.claimed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            exhausted = stats.exhausted,
            released = stats.released,
            affected = stats.affected,
            avg_item_ms = stats.avg_item_latency_ms(),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "cycle complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use flightwork_core::SubjectRef;

    use crate::queue::{InMemoryWorkQueueStore, NewWorkItem, RetryPolicy};
    use crate::scheduler::delegate::{BatchResult, ItemHandlerDelegate};

    async fn seeded(n: usize) -> Arc<InMemoryWorkQueueStore> {
        let store = InMemoryWorkQueueStore::arc(RetryPolicy::fixed(3, Duration::from_secs(60)));
        for i in 0..n {
            store
                .enqueue(NewWorkItem::new(SubjectRef::new(format!("N{i}")).unwrap()))
                .await
                .unwrap();
        }
        store
    }

    fn config(batch_size: usize, max_iterations: u32) -> RunnerConfig {
        RunnerConfig {
            batch_size,
            max_iterations,
            backlog: BacklogClassifier::new(100, 2),
            lease: LeaseRecovery::new(Duration::from_secs(600)),
        }
    }

    /// Delegate that enqueues more work than it drains on every call.
    struct Refilling {
        store: Arc<InMemoryWorkQueueStore>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProcessingDelegate for Refilling {
        fn name(&self) -> &str {
            "refilling"
        }

        async fn process(&self, batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for i in 0..batch.len() * 2 {
                self.store
                    .enqueue(NewWorkItem::new(SubjectRef::new(format!("R{i}")).unwrap()))
                    .await
                    .map_err(|e| DelegateError::Connectivity(e.to_string()))?;
            }
            Ok(BatchResult::all_succeeded(batch))
        }
    }

    #[tokio::test]
    async fn empty_queue_short_circuits() {
        let store = seeded(0).await;
        let runner = BatchRunner::new(
            "test",
            store,
            ItemHandlerDelegate::new("noop", |_| ItemOutcome::Succeeded),
            config(10, 5),
        );

        let stats = runner.run_cycle(0, &TierFilter::Any).await.unwrap();
        assert!(stats.is_idle());
        assert_eq!(stats.batches, 0);
        assert!(stats.aborted.is_none());
    }

    #[tokio::test]
    async fn per_item_failures_do_not_abort_the_batch() {
        let store = seeded(6).await;
        let runner = BatchRunner::new(
            "test",
            store.clone(),
            ItemHandlerDelegate::new("odd-fails", |item| {
                if item.subject_ref.as_str().ends_with(['1', '3', '5']) {
                    ItemOutcome::Failed("no route".into())
                } else {
                    ItemOutcome::Succeeded
                }
            }),
            config(10, 5),
        );

        let stats = runner.run_cycle(0, &TierFilter::Any).await.unwrap();
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.exhausted, 0);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.complete, 3);
        assert_eq!(counts.pending, 3);
    }

    #[tokio::test]
    async fn runner_stops_at_iteration_cap_when_queue_refills() {
        let store = seeded(10).await;
        let delegate = Refilling {
            store: store.clone(),
            calls: AtomicUsize::new(0),
        };
        let runner = BatchRunner::new("test", store.clone(), delegate, config(5, 4));

        let stats = runner.run_cycle(0, &TierFilter::Any).await.unwrap();
        assert_eq!(stats.batches, 4);
        assert_eq!(stats.claimed, 20);
        assert!(store.count_pending(&TierFilter::Any).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn missing_outcomes_count_as_failures() {
        struct Silent;

        #[async_trait::async_trait]
        impl ProcessingDelegate for Silent {
            fn name(&self) -> &str {
                "silent"
            }

            async fn process(&self, _batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
                Ok(BatchResult::new())
            }
        }

        let store = seeded(2).await;
        let runner = BatchRunner::new("test", store.clone(), Silent, config(10, 5));
        let stats = runner.run_cycle(0, &TierFilter::Any).await.unwrap();

        assert_eq!(stats.failed, 2);
        for item in store.snapshot() {
            assert_eq!(item.retry_count, 1);
            assert!(item.last_error.is_some());
        }
    }

    #[tokio::test]
    async fn rejected_batch_fails_each_item() {
        struct Rejecting;

        #[async_trait::async_trait]
        impl ProcessingDelegate for Rejecting {
            fn name(&self) -> &str {
                "rejecting"
            }

            async fn process(&self, _batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
                Err(DelegateError::Batch("function parse_route_batch does not accept NULL".into()))
            }
        }

        let store = seeded(3).await;
        let runner = BatchRunner::new("test", store.clone(), Rejecting, config(10, 5));
        let stats = runner.run_cycle(0, &TierFilter::Any).await.unwrap();

        assert!(stats.aborted.is_none());
        assert_eq!(stats.failed, 3);
        assert_eq!(store.counts().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn set_batch_size_rejects_zero() {
        let mut runner = BatchRunner::new(
            "test",
            seeded(0).await,
            ItemHandlerDelegate::new("noop", |_| ItemOutcome::Succeeded),
            config(10, 5),
        );

        assert!(runner.set_batch_size(0).is_err());
        runner.set_batch_size(25).unwrap();
        assert_eq!(runner.config().batch_size, 25);
    }
}

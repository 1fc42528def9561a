//! Work item model, retry policy and claim filters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flightwork_core::{CoreError, CoreResult, SubjectRef, Tier, WorkItemId};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed (possibly not yet eligible, see `next_eligible_at`)
    Pending,
    /// Claimed by exactly one runner
    Processing,
    /// Processed successfully
    Complete,
    /// Retries exhausted; parked for operator inspection
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Complete => "complete",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "pending" => Ok(WorkStatus::Pending),
            "processing" => Ok(WorkStatus::Processing),
            "complete" => Ok(WorkStatus::Complete),
            "failed" => Ok(WorkStatus::Failed),
            other => Err(CoreError::validation(format!("unknown work status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Complete | WorkStatus::Failed)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy applied by the store when a failure is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an item is parked as FAILED
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Lower bound on any retry delay; keeps `next_eligible_at` in the future
    pub min_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            min_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            min_delay: Duration::from_secs(1).min(delay),
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Calculate the delay before the next attempt after failure number
    /// `attempt` (1-indexed).
    ///
    /// Never returns less than `min_delay`, and never zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let floor = self.min_delay.max(Duration::from_millis(1));
        Duration::from_millis(delay_ms.max(0.0) as u64).max(floor)
    }

    /// Delays for failures `1..=max_retries`, in order.
    ///
    /// Lets a SQL store pick the delay for an attempt inside a single
    /// statement instead of reading the retry count first.
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }

    /// Whether an item with this many recorded failures is exhausted.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// Which tiers a claim (or count) may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierFilter {
    /// Every item regardless of tier.
    Any,
    /// Only items stamped with exactly this tier (manual operation).
    Only(Tier),
    /// Items whose tier is listed, plus every tier at or above
    /// `overflow_from` when set. Untiered items are always admitted.
    Due {
        tiers: Vec<Tier>,
        overflow_from: Option<Tier>,
    },
}

impl TierFilter {
    pub fn admits(&self, tier: Option<Tier>) -> bool {
        match (self, tier) {
            (TierFilter::Any, _) => true,
            (TierFilter::Only(wanted), Some(t)) => *wanted == t,
            (TierFilter::Only(_), None) => false,
            (TierFilter::Due { .. }, None) => true,
            (
                TierFilter::Due {
                    tiers,
                    overflow_from,
                },
                Some(t),
            ) => tiers.contains(&t) || overflow_from.is_some_and(|from| t >= from),
        }
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Domain entity the work concerns
    pub subject_ref: SubjectRef,
    pub status: WorkStatus,
    /// Priority class, `None` for untiered queues
    pub tier: Option<Tier>,
    pub queued_at: DateTime<Utc>,
    /// Set exactly when a claim succeeds, cleared when the item is handed back
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, on the terminal transition
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the item may be claimed
    pub next_eligible_at: DateTime<Utc>,
    /// Failed attempts so far; only an operator requeue resets it
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Request to enqueue a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub subject_ref: SubjectRef,
    pub tier: Option<Tier>,
    /// Defaults to "now" when absent
    pub eligible_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    pub fn new(subject_ref: SubjectRef) -> Self {
        Self {
            subject_ref,
            tier: None,
            eligible_at: None,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Schedule the item for later.
    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.eligible_at = Some(at);
        self
    }
}

impl WorkItem {
    /// Materialize a new PENDING item.
    pub fn new(request: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkItemId::new(),
            subject_ref: request.subject_ref,
            status: WorkStatus::Pending,
            tier: request.tier,
            queued_at: now,
            started_at: None,
            completed_at: None,
            next_eligible_at: request.eligible_at.unwrap_or(now),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Check if the item may be claimed right now under `filter`.
    pub fn is_claimable(&self, now: DateTime<Utc>, filter: &TierFilter) -> bool {
        self.status == WorkStatus::Pending && self.next_eligible_at <= now && filter.admits(self.tier)
    }

    /// PENDING → PROCESSING. Fails unless the item is still PENDING.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != WorkStatus::Pending {
            return Err(self.illegal("claim"));
        }
        self.status = WorkStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// → COMPLETE.
    ///
    /// Also accepted from PENDING: a slow runner may finish an item that
    /// lease recovery already handed back, and the result is still valid.
    pub fn mark_complete(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if !matches!(self.status, WorkStatus::Processing | WorkStatus::Pending) {
            return Err(self.illegal("complete"));
        }
        self.status = WorkStatus::Complete;
        self.completed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Returns to PENDING with backoff, or parks the item as FAILED once the
    /// policy says it is exhausted.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> CoreResult<()> {
        if self.status != WorkStatus::Processing {
            return Err(self.illegal("fail"));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.started_at = None;

        if policy.is_exhausted(self.retry_count) {
            self.status = WorkStatus::Failed;
            self.completed_at = Some(now);
        } else {
            let delay = policy.delay_for_attempt(self.retry_count);
            self.status = WorkStatus::Pending;
            // Saturate: an oversized backoff must still push the item out.
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            self.next_eligible_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        Ok(())
    }

    /// PROCESSING → PENDING without touching the retry count.
    ///
    /// Used by lease recovery and by claim rollback.
    pub fn mark_unclaimed(&mut self) -> CoreResult<()> {
        if self.status != WorkStatus::Processing {
            return Err(self.illegal("unclaim"));
        }
        self.status = WorkStatus::Pending;
        self.started_at = None;
        Ok(())
    }

    /// Operator reset of a parked item: FAILED → PENDING with a fresh budget.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != WorkStatus::Failed {
            return Err(self.illegal("requeue"));
        }
        self.status = WorkStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.started_at = None;
        self.completed_at = None;
        self.next_eligible_at = now;
        Ok(())
    }

    /// Whether a claim started before `cutoff` (and so is past its lease).
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Processing && self.started_at.is_some_and(|at| at < cutoff)
    }

    fn illegal(&self, action: &str) -> CoreError {
        CoreError::invalid_transition(format!(
            "cannot {action} work item {} in status {}",
            self.id, self.status
        ))
    }
}

/// Store-wide counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub complete: u64,
    /// Parked after exhausting retries (the dead-letter set)
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(now: DateTime<Utc>) -> WorkItem {
        WorkItem::new(NewWorkItem::new(SubjectRef::new("DAL42").unwrap()), now)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            min_delay: Duration::from_millis(1),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            min_delay: Duration::from_millis(1),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn backoff_never_drops_below_floor() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            min_delay: Duration::from_secs(2),
            ..RetryPolicy::fixed(3, Duration::ZERO)
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert!(policy.delay_schedule().iter().all(|d| *d >= Duration::from_secs(2)));
    }

    #[test]
    fn delay_schedule_has_one_entry_per_retry() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(5));
        assert_eq!(policy.delay_schedule(), vec![Duration::from_secs(5); 4]);
    }

    #[test]
    fn due_filter_admits_listed_overflow_and_untiered() {
        let filter = TierFilter::Due {
            tiers: vec![Tier(0), Tier(2)],
            overflow_from: Some(Tier(5)),
        };

        assert!(filter.admits(None));
        assert!(filter.admits(Some(Tier(0))));
        assert!(!filter.admits(Some(Tier(1))));
        assert!(filter.admits(Some(Tier(2))));
        assert!(!filter.admits(Some(Tier(4))));
        assert!(filter.admits(Some(Tier(7))));

        assert!(!TierFilter::Only(Tier(3)).admits(None));
        assert!(TierFilter::Only(Tier(3)).admits(Some(Tier(3))));
    }

    #[test]
    fn failure_backs_off_then_exhausts() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(2, Duration::from_secs(60));
        let mut item = item(now);

        item.mark_claimed(now).unwrap();
        item.mark_failed("timeout", now, &policy).unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.next_eligible_at, now + chrono::Duration::seconds(60));
        assert!(item.started_at.is_none());
        assert!(item.completed_at.is_none());

        item.mark_claimed(now).unwrap();
        item.mark_failed("timeout again", now, &policy).unwrap();
        assert_eq!(item.status, WorkStatus::Failed);
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.completed_at, Some(now));
        assert_eq!(item.last_error.as_deref(), Some("timeout again"));
    }

    #[test]
    fn oversized_backoff_saturates_instead_of_retrying_at_once() {
        let now = Utc::now();
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            min_delay: Duration::from_millis(1),
            strategy: BackoffStrategy::Fixed,
        };
        let mut item = item(now);

        item.mark_claimed(now).unwrap();
        item.mark_failed("timeout", now, &policy).unwrap();

        assert_eq!(item.status, WorkStatus::Pending);
        assert!(item.next_eligible_at > now);
        assert!(!item.is_claimable(now, &TierFilter::Any));
    }

    #[test]
    fn claim_requires_pending() {
        let now = Utc::now();
        let mut item = item(now);
        item.mark_claimed(now).unwrap();

        let err = item.mark_claimed(now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn success_clears_last_error() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut item = item(now);

        item.mark_claimed(now).unwrap();
        item.mark_failed("boom", now, &policy).unwrap();
        item.next_eligible_at = now;
        item.mark_claimed(now).unwrap();
        item.mark_complete(now).unwrap();

        assert_eq!(item.status, WorkStatus::Complete);
        assert!(item.last_error.is_none());
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn requeue_resets_budget_only_from_failed() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(1, Duration::from_secs(1));
        let mut item = item(now);

        assert!(item.mark_requeued(now).is_err());

        item.mark_claimed(now).unwrap();
        item.mark_failed("bad route string", now, &policy).unwrap();
        item.mark_requeued(now).unwrap();

        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.completed_at.is_none());
        assert!(item.last_error.is_none());
    }
}

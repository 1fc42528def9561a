//! Per-cycle and cumulative counters.

use std::time::{Duration, Instant};

use serde::Serialize;

/// What one cycle did. Ephemeral; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    /// Eligible pending count observed at cycle start
    pub pending_at_start: u64,
    pub processing_at_start: u64,
    pub recovered: u64,
    pub backlogged: bool,
    pub multiplier: u32,
    /// Non-empty batches handed to the delegate
    pub batches: u32,
    pub claimed: u64,
    /// Items with a recorded outcome (succeeded + failed)
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Failures that parked the item for good
    pub exhausted: u64,
    /// Claims handed back after a delegate connectivity failure
    pub released: u64,
    /// Sub-entities the delegate reported touching
    pub affected: u64,
    #[serde(with = "millis")]
    pub delegate_time: Duration,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    /// Why the cycle stopped early, if it did
    pub aborted: Option<String>,
}

impl CycleStats {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            multiplier: 1,
            ..Default::default()
        }
    }

    /// Nothing was claimed.
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    /// Average delegate latency per processed item, in milliseconds.
    pub fn avg_item_latency_ms(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.delegate_time.as_secs_f64() * 1_000.0 / self.processed as f64
    }
}

/// Totals since process start.
#[derive(Debug, Clone)]
pub struct RunTotals {
    pub started: Instant,
    pub cycles: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub exhausted: u64,
    pub recovered: u64,
    /// Cycles cut short by store or delegate errors
    pub errors: u64,
    pub delegate_time: Duration,
}

impl Default for RunTotals {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            cycles: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            exhausted: 0,
            recovered: 0,
            errors: 0,
            delegate_time: Duration::ZERO,
        }
    }
}

impl RunTotals {
    pub fn absorb(&mut self, cycle: &CycleStats) {
        self.cycles += 1;
        self.processed += cycle.processed;
        self.succeeded += cycle.succeeded;
        self.failed += cycle.failed;
        self.exhausted += cycle.exhausted;
        self.recovered += cycle.recovered;
        self.delegate_time += cycle.delegate_time;
        if cycle.aborted.is_some() {
            self.errors += 1;
        }
    }

    pub fn avg_item_latency_ms(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.delegate_time.as_secs_f64() * 1_000.0 / self.processed as f64
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

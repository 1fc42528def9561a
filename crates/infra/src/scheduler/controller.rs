//! Daemon lifecycle: run-once, run-loop, pacing and graceful shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flightwork_core::Tier;

use crate::queue::{TierFilter, WorkQueueStore};

use super::delegate::ProcessingDelegate;
use super::runner::BatchRunner;
use super::stats::{CycleStats, RunTotals};
use super::tier::TierSchedule;
use super::SchedulerError;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Sleep between cycles that did some work
    pub interval: Duration,
    /// Idle cycles sleep `interval * idle_factor`
    pub idle_factor: u32,
    /// Backlogged cycles sleep `interval / backlog_divisor`
    pub backlog_divisor: u32,
    /// Floor for the backlogged sleep
    pub min_interval: Duration,
    /// Delay before the first cycle, so daemons sharing a database spread out
    pub startup_stagger: Duration,
    /// Log store-wide counts every this many cycles (0 disables)
    pub stats_every_cycles: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_factor: 2,
            backlog_divisor: 2,
            min_interval: Duration::from_secs(5),
            startup_stagger: Duration::ZERO,
            stats_every_cycles: 10,
        }
    }
}

impl ControllerConfig {
    /// How long to sleep after a cycle that produced `stats`.
    pub fn next_delay(&self, stats: &CycleStats) -> Duration {
        if stats.is_idle() {
            self.interval.saturating_mul(self.idle_factor.max(1))
        } else if stats.backlogged {
            (self.interval / self.backlog_divisor.max(1)).max(self.min_interval)
        } else {
            self.interval
        }
    }
}

/// Owns one runner for the lifetime of the process.
///
/// All mutable daemon state (cycle counter, totals) lives here, so several
/// controllers can share a process without interfering.
pub struct DaemonController<S: WorkQueueStore, D: ProcessingDelegate> {
    runner: BatchRunner<S, D>,
    tiers: TierSchedule,
    config: ControllerConfig,
    shutdown: CancellationToken,
    cycle: u64,
    totals: RunTotals,
}

impl<S: WorkQueueStore, D: ProcessingDelegate> DaemonController<S, D> {
    pub fn new(
        runner: BatchRunner<S, D>,
        tiers: TierSchedule,
        config: ControllerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner,
            tiers,
            config,
            shutdown,
            cycle: 0,
            totals: RunTotals::default(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    pub fn runner(&self) -> &BatchRunner<S, D> {
        &self.runner
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<(), SchedulerError> {
        self.runner.set_batch_size(batch_size)?;
        info!(queue = %self.runner.queue(), batch_size, "batch size updated");
        Ok(())
    }

    /// Single cycle over every tier.
    pub async fn run_once(&mut self) -> Result<CycleStats, SchedulerError> {
        let filter = self.tiers.filter_for_cycle(0);
        let stats = self.step(&filter).await?;
        self.log_totals();
        Ok(stats)
    }

    /// Single cycle over one tier only, for manual operation.
    pub async fn run_tier(&mut self, tier: Tier) -> Result<CycleStats, SchedulerError> {
        info!(queue = %self.runner.queue(), %tier, "processing single tier");
        let stats = self.step(&TierFilter::Only(tier)).await?;
        self.log_totals();
        Ok(stats)
    }

    /// Cycle until the shutdown token is cancelled.
    ///
    /// Returns the totals on clean shutdown; a fatal error ends the loop and
    /// is returned so the process can exit non-zero.
    pub async fn run_loop(&mut self) -> Result<RunTotals, SchedulerError> {
        info!(
            queue = %self.runner.queue(),
            interval_secs = self.config.interval.as_secs(),
            stagger_secs = self.config.startup_stagger.as_secs(),
            batch_size = self.runner.config().batch_size,
            tiers = ?self.tiers.cadences(),
            "daemon starting"
        );

        if !self.config.startup_stagger.is_zero() {
            self.pause(self.config.startup_stagger).await;
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let filter = self.tiers.filter_for_cycle(self.cycle);
            let stats = match self.step(&filter).await {
                Ok(stats) => stats,
                Err(err) => {
                    error!(queue = %self.runner.queue(), error = %err, "fatal error; stopping daemon");
                    self.log_totals();
                    return Err(err);
                }
            };

            if self.config.stats_every_cycles > 0 && self.cycle % self.config.stats_every_cycles == 0 {
                self.log_queue_status().await;
            }

            let delay = self.config.next_delay(&stats);
            self.pause(delay).await;
        }

        info!(queue = %self.runner.queue(), "shutdown requested");
        self.log_totals();
        Ok(self.totals.clone())
    }

    async fn step(&mut self, filter: &TierFilter) -> Result<CycleStats, SchedulerError> {
        let stats = self.runner.run_cycle(self.cycle, filter).await?;
        self.totals.absorb(&stats);
        self.cycle += 1;
        Ok(stats)
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn log_queue_status(&self) {
        match self.runner.store().counts().await {
            Ok(counts) => info!(
                queue = %self.runner.queue(),
                pending = counts.pending,
                processing = counts.processing,
                complete = counts.complete,
                failed = counts.failed,
                processed_total = self.totals.processed,
                errors_total = self.totals.errors,
                avg_item_ms = self.totals.avg_item_latency_ms(),
                uptime_secs = self.totals.uptime().as_secs(),
                "queue status"
            ),
            Err(err) => warn!(queue = %self.runner.queue(), error = %err, "could not read queue counts"),
        }
    }

    fn log_totals(&self) {
        info!(
            queue = %self.runner.queue(),
            cycles = self.totals.cycles,
            processed = self.totals.processed,
            succeeded = self.totals.succeeded,
            failed = self.totals.failed,
            exhausted = self.totals.exhausted,
            recovered = self.totals.recovered,
            errors = self.totals.errors,
            avg_item_ms = self.totals.avg_item_latency_ms(),
            uptime_secs = self.totals.uptime().as_secs(),
            "run totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(claimed: u64, backlogged: bool) -> CycleStats {
        CycleStats {
            claimed,
            backlogged,
            ..CycleStats::new(0)
        }
    }

    #[test]
    fn idle_cycles_sleep_longer() {
        let config = ControllerConfig {
            interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(config.next_delay(&stats(0, false)), Duration::from_secs(60));
        assert_eq!(config.next_delay(&stats(5, false)), Duration::from_secs(30));
    }

    #[test]
    fn backlogged_cycles_sleep_shorter_but_not_below_floor() {
        let config = ControllerConfig {
            interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.next_delay(&stats(100, true)), Duration::from_secs(15));

        // Backlogged but nothing claimable: still an idle cycle.
        assert_eq!(config.next_delay(&stats(0, true)), Duration::from_secs(60));

        let tight = ControllerConfig {
            interval: Duration::from_secs(6),
            ..config
        };
        assert_eq!(tight.next_delay(&stats(100, true)), Duration::from_secs(5));
    }
}

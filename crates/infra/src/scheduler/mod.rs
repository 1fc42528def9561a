//! Tiered adaptive-batch scheduler.
//!
//! ## Components
//!
//! - `LeaseRecovery`: hands abandoned claims back to the queue
//! - `BacklogClassifier`: scales the batch size while the queue is behind
//! - `TierSchedule`: decides which priority tiers are due in a cycle
//! - `BatchRunner`: one cycle of claim → process → record
//! - `DaemonController`: run-once / run-loop lifecycle, pacing, shutdown
//!
//! Errors never escape a cycle in loop mode unless they are fatal
//! (misconfiguration); everything else is logged and retried next cycle.

pub mod backlog;
pub mod controller;
pub mod delegate;
pub mod lease;
pub mod runner;
pub mod shutdown;
pub mod stats;
pub mod tier;

pub use backlog::{BacklogClassifier, BacklogDecision};
pub use controller::{ControllerConfig, DaemonController};
pub use delegate::{
    BatchResult, DelegateError, ItemHandler, ItemHandlerDelegate, ItemOutcome, ProcessingDelegate,
};
pub use lease::LeaseRecovery;
pub use runner::{BatchRunner, RunnerConfig};
pub use shutdown::install_signal_handlers;
pub use stats::{CycleStats, RunTotals};
pub use tier::TierSchedule;

use crate::queue::StoreError;

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delegate(#[from] DelegateError),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

impl SchedulerError {
    /// Errors that must stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Store(err) => err.is_fatal(),
            SchedulerError::Delegate(err) => matches!(err, DelegateError::Misconfigured(_)),
            SchedulerError::InvalidSetting(_) => true,
        }
    }
}

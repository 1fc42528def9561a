//! Work queue persistence.
//!
//! A queue is a table of work items keyed by id. Producers enqueue items;
//! daemons claim them in batches, hand them to a processing delegate, and
//! record the outcome.
//!
//! ```text
//! PENDING ── claim_batch ──► PROCESSING ── record_success ──► COMPLETE
//!    ▲                           │
//!    ├──── reset_stuck ──────────┤
//!    ├──── release_claims ───────┤
//!    ├──── retries left ─────────┤ record_failure
//!    │                           ▼ retries exhausted
//!    └──── requeue_exhausted ─ FAILED
//! ```
//!
//! `FAILED` items are the dead-letter set: they stay put until an operator
//! requeues or discards them.

pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use in_memory::InMemoryWorkQueueStore;
pub use postgres::{PostgresWorkQueueStore, connect, connect_lazy, validate_identifier};
pub use store::{StoreError, WorkQueueStore};
pub use types::{
    BackoffStrategy, NewWorkItem, QueueCounts, RetryPolicy, TierFilter, WorkItem, WorkStatus,
};

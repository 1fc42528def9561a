//! Infrastructure layer: queue stores, the batch scheduler, configuration,
//! and the concrete per-queue daemons.

pub mod config;
pub mod daemons;
pub mod queue;
pub mod scheduler;

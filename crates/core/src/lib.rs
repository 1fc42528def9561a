//! `flightwork-core`: primitives shared by the work-queue daemons.
//!
//! This crate contains **pure** building blocks (no storage or runtime concerns).

pub mod clock;
pub mod error;
pub mod id;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{SubjectRef, WorkItemId};
pub use tier::Tier;

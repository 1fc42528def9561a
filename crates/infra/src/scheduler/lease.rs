//! Recovery of claims abandoned by crashed or stalled runners.

use std::time::Duration;

use tracing::{debug, warn};

use crate::queue::{StoreError, WorkQueueStore};

/// Resets PROCESSING items whose claim is older than the lease timeout.
///
/// Recovery is by age alone; a slow runner that is still alive may end up
/// processing an item a second time, which downstream processing tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRecovery {
    lease_timeout: Duration,
}

impl LeaseRecovery {
    pub fn new(lease_timeout: Duration) -> Self {
        Self { lease_timeout }
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Run one recovery pass; returns how many items went back to PENDING.
    pub async fn run<S>(&self, queue: &str, store: &S) -> Result<u64, StoreError>
    where
        S: WorkQueueStore + ?Sized,
    {
        let recovered = store.reset_stuck(self.lease_timeout).await?;
        if recovered > 0 {
            warn!(
                queue,
                recovered,
                lease_secs = self.lease_timeout.as_secs(),
                "recovered stuck work items"
            );
        } else {
            debug!(queue, "no stuck work items");
        }
        Ok(recovered)
    }
}

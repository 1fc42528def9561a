//! The processing seam: domain work injected into the scheduler.

use std::collections::HashMap;
use std::time::Duration;

use flightwork_core::WorkItemId;

use crate::queue::WorkItem;

/// Outcome of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
}

/// Result of one delegate call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Per-item outcome; items missing here count as failed
    pub outcomes: HashMap<WorkItemId, ItemOutcome>,
    /// Sub-entities touched (waypoints written, boundaries crossed, ...)
    pub affected: u64,
    /// Time the delegate reports for the batch; the runner measures it when absent
    pub elapsed: Option<Duration>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(mut self, id: WorkItemId) -> Self {
        self.outcomes.insert(id, ItemOutcome::Succeeded);
        self
    }

    pub fn failed(mut self, id: WorkItemId, error: impl Into<String>) -> Self {
        self.outcomes.insert(id, ItemOutcome::Failed(error.into()));
        self
    }

    pub fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    /// Every item of `batch` succeeded.
    pub fn all_succeeded(batch: &[WorkItem]) -> Self {
        batch
            .iter()
            .fold(Self::new(), |result, item| result.succeeded(item.id))
    }
}

/// Failure of a delegate call as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DelegateError {
    /// The backend could not be reached; the batch is handed back untouched.
    #[error("delegate connectivity failure: {0}")]
    Connectivity(String),
    /// The backend rejected the batch; every item gets a failed attempt.
    #[error("delegate rejected batch: {0}")]
    Batch(String),
    /// The delegate is wired wrong (missing procedure, bad result shape).
    #[error("delegate misconfigured: {0}")]
    Misconfigured(String),
}

/// Expensive, domain-specific unit of work invoked once per claimed batch.
///
/// Implementations must be idempotent: lease recovery can hand the same
/// item to two runners. The scheduler never looks at the payload behind an
/// item's subject reference.
#[async_trait::async_trait]
pub trait ProcessingDelegate: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    async fn process(&self, batch: &[WorkItem]) -> Result<BatchResult, DelegateError>;
}

/// Per-item handler function type.
pub type ItemHandler = Box<dyn Fn(&WorkItem) -> ItemOutcome + Send + Sync>;

/// Delegate that runs an in-process handler on each item of the batch.
///
/// Handy for lightweight daemons and for tests.
pub struct ItemHandlerDelegate {
    name: String,
    handler: ItemHandler,
}

impl ItemHandlerDelegate {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&WorkItem) -> ItemOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(handler),
        }
    }
}

impl std::fmt::Debug for ItemHandlerDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemHandlerDelegate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ProcessingDelegate for ItemHandlerDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
        let mut result = BatchResult::new();
        for item in batch {
            result.outcomes.insert(item.id, (self.handler)(item));
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl<T: ProcessingDelegate + ?Sized> ProcessingDelegate for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn process(&self, batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
        (**self).process(batch).await
    }
}

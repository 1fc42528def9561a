//! Delegate that hands a batch to a database stored procedure.

use std::time::Instant;

use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use flightwork_core::WorkItemId;

use crate::queue::postgres::{SqlFailure, classify_sqlx_error};
use crate::queue::{StoreError, WorkItem, validate_identifier};
use crate::scheduler::{BatchResult, DelegateError, ItemOutcome, ProcessingDelegate};

/// Calls `SELECT item_id, ok, error, affected FROM <procedure>($1::uuid[])`.
///
/// The procedure receives the claimed item ids, does the domain work
/// (route expansion, boundary lookup, ETA math, delivery), and returns one
/// row per item it handled. `affected` is the number of sub-entities it
/// wrote for that item and may be NULL.
#[derive(Debug, Clone)]
pub struct StoredProcedureDelegate {
    pool: PgPool,
    procedure: String,
}

impl StoredProcedureDelegate {
    pub fn new(pool: PgPool, procedure: impl Into<String>) -> Result<Self, StoreError> {
        let procedure = procedure.into();
        validate_identifier(&procedure)?;
        Ok(Self { pool, procedure })
    }
}

#[async_trait::async_trait]
impl ProcessingDelegate for StoredProcedureDelegate {
    fn name(&self) -> &str {
        &self.procedure
    }

    async fn process(&self, batch: &[WorkItem]) -> Result<BatchResult, DelegateError> {
        let ids: Vec<Uuid> = batch.iter().map(|item| *item.id.as_uuid()).collect();
        let sql = format!(
            "SELECT item_id, ok, error, affected FROM {}($1::uuid[])",
            self.procedure
        );

        let started = Instant::now();
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_delegate_error(&self.procedure, e))?;
        let elapsed = started.elapsed();

        let mut result = BatchResult::new();
        result.elapsed = Some(elapsed);

        for row in rows {
            let decode = |e: sqlx::Error| {
                DelegateError::Misconfigured(format!(
                    "{} returned an unexpected row shape: {e}",
                    self.procedure
                ))
            };
            let id: Uuid = row.try_get("item_id").map_err(decode)?;
            let ok: bool = row.try_get("ok").map_err(decode)?;
            let error: Option<String> = row.try_get("error").map_err(decode)?;
            let affected: Option<i64> = row.try_get("affected").map_err(decode)?;

            result.affected += affected.unwrap_or(0).max(0) as u64;
            let outcome = if ok {
                ItemOutcome::Succeeded
            } else {
                ItemOutcome::Failed(error.unwrap_or_else(|| format!("{} reported failure", self.procedure)))
            };
            result.outcomes.insert(WorkItemId::from_uuid(id), outcome);
        }

        debug!(
            procedure = %self.procedure,
            items = batch.len(),
            rows = result.outcomes.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "procedure batch finished"
        );
        Ok(result)
    }
}

fn map_delegate_error(procedure: &str, err: sqlx::Error) -> DelegateError {
    let msg = format!("{procedure}: {err}");
    match classify_sqlx_error(&err) {
        SqlFailure::Transient => DelegateError::Connectivity(msg),
        SqlFailure::Rejected => DelegateError::Batch(msg),
        SqlFailure::Configuration => DelegateError::Misconfigured(msg),
    }
}

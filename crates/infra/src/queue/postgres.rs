//! Postgres-backed work queue store.
//!
//! One table per queue, schema in `migrations/0001_work_queue.sql`. Every
//! operation is a single statement, so there is never a read-then-write
//! window for a concurrent daemon to race into.
//!
//! ## Claiming
//!
//! `claim_batch` selects candidates with `FOR UPDATE SKIP LOCKED` and flips
//! them to `processing` in the same statement, re-checking
//! `status = 'pending'` in the update predicate. Two daemons running the
//! same claim concurrently therefore get disjoint batches.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database (undefined table/column/function) | `42P01`, `42703`, `42883` | `Configuration` |
//! | Database (connection exception, shutdown, resources, serialization, deadlock) | `08xxx`, `57Pxx`, `53xxx`, `40001`, `40P01` | `Transient` |
//! | Database (other) | any other | `Transient` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Transient` |
//! | Configuration / ColumnNotFound / decode errors | N/A | `Configuration` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use flightwork_core::{SubjectRef, Tier, WorkItemId};

use super::store::{StoreError, WorkQueueStore};
use super::types::{NewWorkItem, QueueCounts, RetryPolicy, TierFilter, WorkItem, WorkStatus};

const COLUMNS: &str = "id, subject_ref, status, tier, queued_at, started_at, completed_at, \
                       next_eligible_at, retry_count, last_error";

/// Open a connection pool, failing unless the database answers now.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    pool_options(max_connections, acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| map_connect_error("connect", e))
}

/// Build a pool without touching the database.
///
/// Only the URL is checked here. Connections are opened on first use, so
/// an unreachable database surfaces as a transient error from the first
/// store operation instead of at startup.
pub fn connect_lazy(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    pool_options(max_connections, acquire_timeout)
        .connect_lazy(database_url)
        .map_err(|e| map_connect_error("connect_lazy", e))
}

fn pool_options(max_connections: u32, acquire_timeout: Duration) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
}

fn map_connect_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Configuration(err) => {
            StoreError::Configuration(format!("invalid database url: {err}"))
        }
        other => map_sqlx_error(operation, other),
    }
}

/// Postgres work queue on one table.
#[derive(Debug, Clone)]
pub struct PostgresWorkQueueStore {
    pool: PgPool,
    table: String,
    policy: RetryPolicy,
    /// Backoff per failure number, in seconds (index 0 = first failure)
    delay_secs: Vec<f64>,
}

impl PostgresWorkQueueStore {
    pub fn new(pool: PgPool, table: impl Into<String>, policy: RetryPolicy) -> Result<Self, StoreError> {
        let table = table.into();
        validate_identifier(&table)?;
        let delay_secs = policy
            .delay_schedule()
            .iter()
            .map(Duration::as_secs_f64)
            .collect();
        Ok(Self {
            pool,
            table,
            policy,
            delay_secs,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain a zero-row conditional update: missing item, or wrong status.
    async fn explain_miss(&self, id: WorkItemId, wanted: &str) -> StoreError {
        let sql = format!("SELECT status FROM {} WHERE id = $1", self.table);
        match sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(row)) => {
                let status: String = row.try_get("status").unwrap_or_default();
                StoreError::StaleClaim {
                    id,
                    detail: format!("expected {wanted}, found {status}"),
                }
            }
            Err(e) => map_sqlx_error("explain_miss", e),
        }
    }
}

#[async_trait::async_trait]
impl WorkQueueStore for PostgresWorkQueueStore {
    #[instrument(skip(self, request), fields(table = %self.table), err)]
    async fn enqueue(&self, request: NewWorkItem) -> Result<WorkItem, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, subject_ref, status, tier, queued_at, next_eligible_at, retry_count)
            VALUES ($1, $2, 'pending', $3, NOW(), COALESCE($4, NOW()), 0)
            RETURNING {COLUMNS}
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::from(WorkItemId::new()))
            .bind(request.subject_ref.as_str())
            .bind(request.tier.map(|t| i16::from(t.value())))
            .bind(request.eligible_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        row_to_item(&row)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn count_pending(&self, filter: &TierFilter) -> Result<u64, StoreError> {
        let clause = TierClause::new(filter, 1);
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} \
             WHERE status = 'pending' AND next_eligible_at <= NOW() AND {}",
            self.table, clause.sql
        );
        let row = clause
            .bind(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_pending", e))?;
        count_from(&row)
    }

    async fn count_processing(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE status = 'processing'",
            self.table
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_processing", e))?;
        count_from(&row)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let sql = format!(
            "SELECT status, COUNT(*) AS n FROM {} GROUP BY status",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("counts", e))?;
            let n = count_from(&row)?;
            match WorkStatus::parse(&status) {
                Ok(WorkStatus::Pending) => counts.pending = n,
                Ok(WorkStatus::Processing) => counts.processing = n,
                Ok(WorkStatus::Complete) => counts.complete = n,
                Ok(WorkStatus::Failed) => counts.failed = n,
                Err(e) => return Err(StoreError::Configuration(e.to_string())),
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self, filter), fields(table = %self.table), err)]
    async fn claim_batch(
        &self,
        filter: &TierFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let clause = TierClause::new(filter, 2);
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id
                FROM {table}
                WHERE status = 'pending'
                  AND next_eligible_at <= NOW()
                  AND {tier}
                ORDER BY COALESCE(tier, 0), queued_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} AS w
            SET status = 'processing', started_at = NOW()
            FROM candidates
            WHERE w.id = candidates.id AND w.status = 'pending'
            RETURNING {returning}
            "#,
            table = self.table,
            tier = clause.sql,
            returning = qualified_columns("w"),
        );

        let query = sqlx::query(&sql).bind(i64::try_from(limit).unwrap_or(i64::MAX));
        let rows = clause
            .bind(query, filter)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        rows.iter().map(row_to_item).collect()
    }

    async fn record_success(&self, id: WorkItemId) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'complete', completed_at = NOW(), last_error = NULL
            WHERE id = $1 AND status IN ('processing', 'pending')
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_success", e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, "processing").await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(table = %self.table), err)]
    async fn record_failure(&self, id: WorkItemId, error: &str) -> Result<WorkItem, StoreError> {
        // SET expressions all see the pre-update row, so `retry_count + 1`
        // is the new count everywhere below.
        let sql = format!(
            r#"
            UPDATE {table}
            SET retry_count = retry_count + 1,
                last_error = $2,
                started_at = NULL,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN retry_count + 1 >= $3 THEN NOW() ELSE completed_at END,
                next_eligible_at = CASE
                    WHEN retry_count + 1 >= $3 THEN next_eligible_at
                    ELSE NOW() + make_interval(
                        secs => ($4::float8[])[LEAST(retry_count + 1, cardinality($4::float8[]))]
                    )
                END
            WHERE id = $1 AND status = 'processing'
            RETURNING {COLUMNS}
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .bind(i32::try_from(self.policy.max_retries).unwrap_or(i32::MAX))
            .bind(&self.delay_secs)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;

        match row {
            Some(row) => row_to_item(&row),
            None => Err(self.explain_miss(id, "processing").await),
        }
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn reset_stuck(&self, older_than: Duration) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'pending', started_at = NULL
            WHERE status = 'processing'
              AND started_at < NOW() - make_interval(secs => $1)
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(older_than.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_stuck", e))?;
        Ok(result.rows_affected())
    }

    async fn release_claims(&self, ids: &[WorkItemId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'pending', started_at = NULL
            WHERE id = ANY($1) AND status = 'processing'
            "#,
            self.table
        );
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(&sql)
            .bind(&uuids)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_claims", e))?;
        Ok(result.rows_affected())
    }

    async fn list_exhausted(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM {}
            WHERE status = 'failed'
            ORDER BY completed_at ASC, id ASC
            LIMIT $1
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_exhausted", e))?;
        rows.iter().map(row_to_item).collect()
    }

    async fn requeue_exhausted(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'pending',
                retry_count = 0,
                last_error = NULL,
                started_at = NULL,
                completed_at = NULL,
                next_eligible_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING {COLUMNS}
            "#,
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_exhausted", e))?;

        match row {
            Some(row) => row_to_item(&row),
            None => Err(self.explain_miss(id, "failed").await),
        }
    }

    async fn discard_exhausted(&self, id: WorkItemId) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND status = 'failed'",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("discard_exhausted", e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, "failed").await);
        }
        Ok(())
    }
}

/// SQL predicate for a [`TierFilter`], with placeholders numbered from `first_param`.
struct TierClause {
    sql: String,
}

impl TierClause {
    fn new(filter: &TierFilter, first_param: usize) -> Self {
        let sql = match filter {
            TierFilter::Any => "TRUE".to_string(),
            TierFilter::Only(_) => format!("tier = ${first_param}"),
            TierFilter::Due { .. } => format!(
                "(tier IS NULL OR tier = ANY(${a}) OR (${b}::smallint IS NOT NULL AND tier >= ${b}))",
                a = first_param,
                b = first_param + 1
            ),
        };
        Self { sql }
    }

    fn bind<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
        filter: &TierFilter,
    ) -> Query<'q, Postgres, PgArguments> {
        match filter {
            TierFilter::Any => query,
            TierFilter::Only(tier) => query.bind(i16::from(tier.value())),
            TierFilter::Due {
                tiers,
                overflow_from,
            } => {
                let tiers: Vec<i16> = tiers.iter().map(|t| i16::from(t.value())).collect();
                query
                    .bind(tiers)
                    .bind(overflow_from.map(|t| i16::from(t.value())))
            }
        }
    }
}

/// Check a (optionally schema-qualified) SQL identifier before it is
/// interpolated into a statement.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63
    };

    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(StoreError::Configuration(format!(
            "invalid SQL identifier: {name:?}"
        )));
    }
    Ok(())
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn count_from(row: &PgRow) -> Result<u64, StoreError> {
    let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count", e))?;
    Ok(n.max(0) as u64)
}

fn row_to_item(row: &PgRow) -> Result<WorkItem, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode work item", e);

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let subject_ref: String = row.try_get("subject_ref").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let tier: Option<i16> = row.try_get("tier").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    let invalid = |e: flightwork_core::CoreError| StoreError::Configuration(e.to_string());
    let tier = tier
        .map(|t| {
            u8::try_from(t)
                .map(Tier)
                .map_err(|_| StoreError::Configuration(format!("tier out of range: {t}")))
        })
        .transpose()?;

    Ok(WorkItem {
        id: WorkItemId::from_uuid(id),
        subject_ref: SubjectRef::new(subject_ref).map_err(invalid)?,
        status: WorkStatus::parse(&status).map_err(invalid)?,
        tier,
        queued_at: row.try_get::<DateTime<Utc>, _>("queued_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        next_eligible_at: row.try_get("next_eligible_at").map_err(decode)?,
        retry_count: retry_count.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}

/// How a database failure should be treated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlFailure {
    /// Connectivity, timeouts, contention: try again later
    Transient,
    /// Schema or wiring is wrong: retrying cannot help
    Configuration,
    /// The statement itself failed (constraint, raised exception)
    Rejected,
}

pub(crate) fn classify_sqlx_error(err: &sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("42P01") | Some("42703") | Some("42883") => SqlFailure::Configuration,
            Some("40001") | Some("40P01") => SqlFailure::Transient,
            Some(code) if code.starts_with("08") || code.starts_with("57P") || code.starts_with("53") => {
                SqlFailure::Transient
            }
            _ => SqlFailure::Rejected,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => SqlFailure::Transient,
        _ => SqlFailure::Configuration,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    let msg = match &err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {}: {}", operation, db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    };
    match classify_sqlx_error(&err) {
        SqlFailure::Transient | SqlFailure::Rejected => StoreError::Transient(msg),
        SqlFailure::Configuration => StoreError::Configuration(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("route_parse_queue").is_ok());
        assert!(validate_identifier("tracking.boundary_queue").is_ok());
        assert!(validate_identifier("1queue").is_err());
        assert!(validate_identifier("queue; DROP TABLE flights").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn tier_clause_numbers_placeholders() {
        assert_eq!(TierClause::new(&TierFilter::Any, 2).sql, "TRUE");
        assert_eq!(TierClause::new(&TierFilter::Only(Tier(1)), 2).sql, "tier = $2");

        let due = TierFilter::Due {
            tiers: vec![Tier(0)],
            overflow_from: None,
        };
        let sql = TierClause::new(&due, 2).sql;
        assert!(sql.contains("ANY($2)"));
        assert!(sql.contains("$3::smallint"));
    }

    #[test]
    fn returning_columns_are_qualified() {
        let cols = qualified_columns("w");
        assert!(cols.starts_with("w.id, w.subject_ref"));
        assert!(cols.ends_with("w.last_error"));
    }

    #[test]
    fn migration_defaults_make_bare_inserts_claimable() {
        let schema = include_str!("../../../../migrations/0001_work_queue.sql");
        let tables: Vec<&str> = schema.split("CREATE TABLE").skip(1).collect();
        assert_eq!(tables.len(), 4);
        for table in tables {
            let ddl = &table[..table.find(");").unwrap()];
            assert!(ddl.contains("id               uuid PRIMARY KEY DEFAULT gen_random_uuid()"));
            assert!(ddl.contains("next_eligible_at timestamptz NOT NULL DEFAULT NOW()"));
            assert!(ddl.contains("status           text NOT NULL DEFAULT 'pending'"));
        }
    }

    #[tokio::test]
    async fn lazy_pool_defers_outage_to_first_operation() {
        let pool = connect_lazy(
            "postgres://flightwork@127.0.0.1:1/tracking",
            1,
            Duration::from_millis(200),
        )
        .expect("lazy pool only parses the url");
        let store =
            PostgresWorkQueueStore::new(pool, "route_parse_queue", RetryPolicy::default()).unwrap();

        let err = store.count_pending(&TierFilter::Any).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn lazy_pool_still_rejects_malformed_urls() {
        let err = connect_lazy("not a url", 1, Duration::from_millis(200)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn pool_errors_are_transient() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            SqlFailure::Transient
        );
        assert!(map_sqlx_error("claim_batch", sqlx::Error::PoolClosed).is_transient());
        assert!(map_sqlx_error("get", sqlx::Error::RowNotFound).is_fatal());
    }
}

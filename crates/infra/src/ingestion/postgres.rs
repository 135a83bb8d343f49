//! Postgres-backed ingestion store.
//!
//! ## Concurrency
//!
//! The claim is a single statement: an `UPDATE` whose `WHERE id IN (...)`
//! sub-select locks due rows with `FOR UPDATE SKIP LOCKED`. Two workers
//! polling at the same instant therefore claim disjoint sets, and no row is
//! ever read by one statement and written by another.
//!
//! Every other write is a conditional `UPDATE ... WHERE status = ...`, so
//! operator actions racing the processor resolve to exactly one winner.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Storage`; inserts use `ON CONFLICT` |
//! | Database (other) | any | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use leadflow_core::TenantId;

use super::store::{
    DeadLetterFilter, IngestionStore, InsertOutcome, JobStats, ReclaimOutcome,
    STALE_RECLAIM_ERROR, StoreError, stats_from_counts,
};
use super::types::{DeadLetterEntry, IngestionJob, JobId, JobStatus, JobTransition};

const JOB_COLUMNS: &str = "id, tenant_id, event_type, event_version, event_key, occurred_at, \
    payload, status, attempt_count, last_error, next_attempt_at, processed_at, \
    dead_lettered_at, created_at, updated_at";

/// Postgres-backed ingestion store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresIngestionStore {
    pool: PgPool,
}

impl PostgresIngestionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazily-connecting pool.
    ///
    /// Connections are opened on first use, so constructing the store never
    /// fails because the database is down; the readiness gate reports that.
    pub fn connect_lazy(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IngestionStore for PostgresIngestionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, tenant_id = %job.tenant_id, event_type = %job.event_type),
        err
    )]
    async fn try_insert(&self, job: IngestionJob) -> Result<InsertOutcome, StoreError> {
        let event_version = to_db_int("event_version", job.event_version)?;
        let inserted: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO ingestion_jobs (
                id, tenant_id, event_type, event_version, event_key, occurred_at,
                payload, status, attempt_count, next_attempt_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $9, $9)
            ON CONFLICT ON CONSTRAINT ingestion_jobs_tenant_event_key DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_str())
        .bind(&job.event_type)
        .bind(event_version)
        .bind(&job.event_key)
        .bind(job.occurred_at)
        .bind(&job.payload)
        .bind(job.next_attempt_at)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        if let Some(id) = inserted {
            return Ok(InsertOutcome::Inserted(JobId::from_uuid(id)));
        }

        let existing: uuid::Uuid = sqlx::query_scalar(
            "SELECT id FROM ingestion_jobs WHERE tenant_id = $1 AND event_key = $2",
        )
        .bind(job.tenant_id.as_str())
        .bind(&job.event_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lookup_duplicate", e))?;

        debug!(existing_job_id = %existing, "duplicate event key");
        Ok(InsertOutcome::Duplicate(JobId::from_uuid(existing)))
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE ingestion_jobs
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                updated_at = $1
            WHERE id IN (
                SELECT id
                FROM ingestion_jobs
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows
            .iter()
            .map(decode_job)
            .collect::<Result<Vec<_>, _>>()?;

        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    #[instrument(skip(self, transition), fields(status = %transition.target_status()), err)]
    async fn transition(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let attempt = to_db_int("attempt", attempt)?;
        let query = match transition {
            JobTransition::Processed => sqlx::query(
                r#"
                UPDATE ingestion_jobs
                SET status = 'processed', processed_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'processing' AND attempt_count = $2
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt)
            .bind(now),
            JobTransition::Retry {
                error,
                next_attempt_at,
            } => sqlx::query(
                r#"
                UPDATE ingestion_jobs
                SET status = 'pending', last_error = $4,
                    next_attempt_at = GREATEST($5, $3), updated_at = $3
                WHERE id = $1 AND status = 'processing' AND attempt_count = $2
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt)
            .bind(now)
            .bind(error)
            .bind(*next_attempt_at),
            JobTransition::DeadLetter { error } => sqlx::query(
                r#"
                UPDATE ingestion_jobs
                SET status = 'dead_letter', last_error = $4,
                    dead_lettered_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'processing' AND attempt_count = $2
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt)
            .bind(now)
            .bind(error),
        };

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch(
        &self,
        job_id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET updated_at = $3
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(to_db_int("attempt", attempt)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        // The payload column is only read when asked for.
        let payload_column = if filter.include_payload {
            "payload"
        } else {
            "NULL::jsonb AS payload"
        };
        let sql = format!(
            r#"
            SELECT id, tenant_id, event_type, event_key, occurred_at, attempt_count,
                   last_error, dead_lettered_at, created_at, updated_at, {payload_column}
            FROM ingestion_jobs
            WHERE status = 'dead_letter'
              AND ($1::text IS NULL OR tenant_id = $1)
            ORDER BY dead_lettered_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(filter.tenant_id.as_ref().map(TenantId::as_str))
            .bind(i64::from(filter.effective_limit()))
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_dead_letter", e))
                    .and_then(DeadLetterEntry::try_from)
            })
            .collect()
    }

    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'pending', dead_lettered_at = NULL,
                next_attempt_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn schedule_now(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET next_attempt_at = $2,
                updated_at = CASE WHEN status = 'pending' THEN $2 ELSE updated_at END
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_now", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReclaimOutcome, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = CASE WHEN attempt_count >= $2 THEN 'dead_letter' ELSE 'pending' END,
                dead_lettered_at = CASE WHEN attempt_count >= $2 THEN $3 ELSE NULL END,
                next_attempt_at = $3,
                last_error = $4,
                updated_at = $3
            WHERE status = 'processing' AND updated_at < $1
            RETURNING status
            "#,
        )
        .bind(cutoff)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(now)
        .bind(STALE_RECLAIM_ERROR)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut outcome = ReclaimOutcome::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_reclaim", e))?;
            if status == JobStatus::DeadLetter.as_str() {
                outcome.dead_lettered += 1;
            } else {
                outcome.requeued += 1;
            }
        }
        Ok(outcome)
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM ingestion_jobs
            WHERE ($1::text IS NULL OR tenant_id = $1)
            GROUP BY status
            "#,
        )
        .bind(tenant_id.map(TenantId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_stats", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("decode_stats", e))?;
            counts.push((parse_status(&status)?, total.max(0) as u64));
        }
        Ok(stats_from_counts(counts))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            StoreError::Storage(format!("unique violation in {operation}: {}", db_err.message()))
        }
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_) => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Bind a `u32` into an `INTEGER` column, refusing values that would wrap.
fn to_db_int(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Storage(format!("{column} {value} exceeds INTEGER range")))
}

fn from_db_int(column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse::<JobStatus>().map_err(StoreError::Corrupt)
}

fn parse_tenant(raw: String) -> Result<TenantId, StoreError> {
    TenantId::new(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_job(row: &PgRow) -> Result<IngestionJob, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))
        .and_then(IngestionJob::try_from)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: String,
    event_type: String,
    event_version: i32,
    event_key: String,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            event_key: row.try_get("event_key")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            processed_at: row.try_get("processed_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for IngestionJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(IngestionJob {
            id: JobId::from_uuid(row.id),
            tenant_id: parse_tenant(row.tenant_id)?,
            event_type: row.event_type,
            event_version: from_db_int("event_version", row.event_version)?,
            event_key: row.event_key,
            occurred_at: row.occurred_at,
            payload: row.payload,
            status: parse_status(&row.status)?,
            attempt_count: from_db_int("attempt_count", row.attempt_count)?,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            processed_at: row.processed_at,
            dead_lettered_at: row.dead_lettered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: uuid::Uuid,
    tenant_id: String,
    event_type: String,
    event_key: String,
    occurred_at: DateTime<Utc>,
    attempt_count: i32,
    last_error: Option<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payload: Option<serde_json::Value>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            event_key: row.try_get("event_key")?,
            occurred_at: row.try_get("occurred_at")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterEntry {
            id: JobId::from_uuid(row.id),
            tenant_id: parse_tenant(row.tenant_id)?,
            event_type: row.event_type,
            event_key: row.event_key,
            occurred_at: row.occurred_at,
            attempt_count: from_db_int("attempt_count", row.attempt_count)?,
            last_error: row.last_error,
            dead_lettered_at: row.dead_lettered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            payload: row.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_columns_reject_values_that_would_wrap() {
        assert_eq!(to_db_int("event_version", 7).unwrap(), 7);
        let err = to_db_int("event_version", u32::MAX).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert!(err.to_string().contains("4294967295"));

        assert_eq!(from_db_int("event_version", 3).unwrap(), 3);
        assert!(matches!(
            from_db_int("attempt_count", -1),
            Err(StoreError::Corrupt(_))
        ));
    }
}

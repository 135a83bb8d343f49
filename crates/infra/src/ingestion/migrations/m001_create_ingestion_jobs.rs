//! Migration 001: the `ingestion_jobs` table.
//!
//! The `(tenant_id, event_key)` unique constraint is the deduplication
//! boundary of the enqueue path; the check constraints pin the
//! status/timestamp invariants in the database itself.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

pub struct CreateIngestionJobs;

#[async_trait]
impl Migration for CreateIngestionJobs {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_ingestion_jobs"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_jobs (
                id               UUID PRIMARY KEY,
                tenant_id        VARCHAR(128) NOT NULL,
                event_type       TEXT NOT NULL,
                event_version    INTEGER NOT NULL DEFAULT 1,
                event_key        TEXT NOT NULL,
                occurred_at      TIMESTAMPTZ NOT NULL,
                payload          JSONB NOT NULL,
                status           VARCHAR(16) NOT NULL DEFAULT 'pending',
                attempt_count    INTEGER NOT NULL DEFAULT 0,
                last_error       TEXT,
                next_attempt_at  TIMESTAMPTZ NOT NULL,
                processed_at     TIMESTAMPTZ,
                dead_lettered_at TIMESTAMPTZ,
                created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT ingestion_jobs_tenant_event_key UNIQUE (tenant_id, event_key),
                CONSTRAINT ingestion_jobs_status_check CHECK (
                    status IN ('pending', 'processing', 'processed', 'failed', 'dead_letter')
                ),
                CONSTRAINT ingestion_jobs_attempt_count_check CHECK (attempt_count >= 0),
                CONSTRAINT ingestion_jobs_processed_at_check CHECK (
                    (status = 'processed') = (processed_at IS NOT NULL)
                ),
                CONSTRAINT ingestion_jobs_dead_lettered_at_check CHECK (
                    (status = 'dead_letter') = (dead_lettered_at IS NOT NULL)
                )
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

//! Migration 002: partial indexes for the hot queries.
//!
//! - claim: due `pending` jobs by `next_attempt_at`
//! - dead-letter feed: per tenant and global, newest first
//! - stale sweep: `processing` jobs by `updated_at`

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

pub struct AddIngestionJobIndexes;

#[async_trait]
impl Migration for AddIngestionJobIndexes {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "add_ingestion_job_indexes"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        for statement in [
            r#"
            CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_due
            ON ingestion_jobs (next_attempt_at)
            WHERE status = 'pending'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_dead_letter_tenant
            ON ingestion_jobs (tenant_id, dead_lettered_at DESC, id DESC)
            WHERE status = 'dead_letter'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_dead_letter_global
            ON ingestion_jobs (dead_lettered_at DESC, id DESC)
            WHERE status = 'dead_letter'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_processing
            ON ingestion_jobs (updated_at)
            WHERE status = 'processing'
            "#,
        ] {
            sqlx::query(statement).execute(&mut **tx).await?;
        }

        Ok(())
    }
}

//! Embedded, forward-only schema migrations for the Postgres ingestion store.
//!
//! Migrations are versioned, checksummed, and tracked in
//! `leadflow_schema_migrations`. Each one runs in its own transaction under a
//! transaction-scoped advisory lock, so several processes may call
//! [`Migrator::run`] at startup without racing each other.
//!
//! # Adding New Migrations
//!
//! 1. Create a new file `mXXX_description.rs` in this directory
//! 2. Implement the `Migration` trait
//! 3. Append the migration to `MIGRATIONS`

mod m001_create_ingestion_jobs;
mod m002_add_ingestion_job_indexes;

use m001_create_ingestion_jobs::CreateIngestionJobs;
use m002_add_ingestion_job_indexes::AddIngestionJobIndexes;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

/// All migrations in order. Add new migrations to the end.
const MIGRATIONS: &[&dyn Migration] = &[&CreateIngestionJobs, &AddIngestionJobIndexes];

/// Advisory lock key serializing concurrent migrators (`"leadflow"` as ASCII).
const MIGRATION_LOCK_KEY: i64 = 0x6c65_6164_666c_6f77;

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        version: i64,
        name: String,
        expected: String,
        found: String,
    },

    #[error("migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        version: i64,
        name: String,
        reason: String,
    },
}

/// A single forward-only schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version number.
    fn version(&self) -> i64;

    fn name(&self) -> &'static str;

    /// Execute the migration. The transaction is owned by the migrator.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// SHA-256 of version + name, recorded for tamper detection.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// Applies pending migrations to a Postgres database.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leadflow_schema_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Run all pending migrations; returns how many were applied.
    ///
    /// Each migration commits on its own; a failure leaves earlier ones applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        for applied in self.applied().await? {
            if let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == applied.version) {
                let found = migration.checksum();
                if found != applied.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: applied.version,
                        name: applied.name,
                        expected: applied.checksum,
                        found,
                    });
                }
            }
        }

        let mut count = 0;
        for migration in MIGRATIONS {
            let mut tx = self.pool.begin().await?;

            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(MIGRATION_LOCK_KEY)
                .execute(&mut *tx)
                .await?;

            let already: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM leadflow_schema_migrations WHERE version = $1",
            )
            .bind(migration.version())
            .fetch_optional(&mut *tx)
            .await?;

            if already.is_some() {
                debug!(
                    version = migration.version(),
                    name = migration.name(),
                    "migration already applied"
                );
                tx.rollback().await?;
                continue;
            }

            info!(
                version = migration.version(),
                name = migration.name(),
                "applying migration"
            );

            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO leadflow_schema_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            count += 1;
        }

        Ok(count)
    }

    /// Current schema version (0 if nothing is applied).
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        Ok(self.applied().await?.last().map(|m| m.version).unwrap_or(0))
    }

    /// Migrations not yet applied.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied: HashSet<i64> = self.applied().await?.iter().map(|m| m.version).collect();
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM leadflow_schema_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<AppliedMigration, MigrationError> {
                Ok(AppliedMigration {
                    version: row.try_get("version")?,
                    name: row.try_get("name")?,
                    applied_at: row.try_get("applied_at")?,
                    checksum: row.try_get("checksum")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let mut prev = 0;
        for migration in MIGRATIONS {
            assert!(
                migration.version() > prev,
                "migration {} must have version > {prev}",
                migration.name()
            );
            prev = migration.version();
        }
    }

    #[test]
    fn checksums_are_stable_and_distinct() {
        assert_eq!(CreateIngestionJobs.checksum(), CreateIngestionJobs.checksum());
        assert_ne!(CreateIngestionJobs.checksum(), AddIngestionJobIndexes.checksum());
        assert_eq!(CreateIngestionJobs.checksum().len(), 64);
    }
}

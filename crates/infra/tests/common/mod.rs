use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Pool for `TEST_DATABASE_URL`, or `None` when Postgres tests are not enabled.
pub async fn pg_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .expect("Failed to create Postgres pool");
    Some(pool)
}

pub async fn teardown(pool: &PgPool) {
    sqlx::query("DROP TABLE IF EXISTS ingestion_jobs CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop ingestion_jobs");
    sqlx::query("DROP TABLE IF EXISTS leadflow_schema_migrations CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop migrations table");
}

//! Durable website event ingestion.
//!
//! Producers hand [`WebsiteEventEnvelope`](leadflow_events::WebsiteEventEnvelope)s
//! to [`IngestionQueue::enqueue`]; each becomes at most one job per
//! `(tenant_id, event_key)`. Workers call [`IngestionQueue::process_batch`],
//! which atomically claims due jobs, dispatches them to the registered
//! [`EventHandler`]s and records the outcome:
//!
//! ```text
//! pending ──claim──▶ processing ──ok──▶ processed
//!    ▲                   │
//!    └──retry/backoff────┤
//!                        └──budget spent──▶ dead_letter ──requeue──▶ pending
//! ```
//!
//! Backends implement [`IngestionStore`]: [`InMemoryIngestionStore`] for tests
//! and development, [`PostgresIngestionStore`] for production.

pub mod dead_letter;
pub mod enqueue;
pub mod handler;
pub mod migrations;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod readiness;
pub mod store;
pub mod types;
pub mod worker;

pub use dead_letter::{DeadLetterManager, RequeueBatchResult, RequeueSingleResult};
pub use enqueue::{EnqueueRejection, EnqueueResult, Enqueuer};
pub use handler::{EventHandler, HandlerContext, HandlerError, HandlerRegistry};
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use postgres::PostgresIngestionStore;
pub use processor::{
    BatchProcessor, BatchResult, DEFAULT_HANDLER_TIMEOUT, DEFAULT_STALE_AFTER,
    HANDLER_TIMEOUT_ERROR, ProcessorConfig,
};
pub use queue::{IngestionError, IngestionQueue, QueueConfig};
pub use readiness::{DEFAULT_READINESS_TIMEOUT, ReadinessGate, ReadinessReport, STORE_UNAVAILABLE};
pub use store::{
    DEFAULT_PAGE_LIMIT, DeadLetterFilter, InMemoryIngestionStore, IngestionStore, InsertOutcome,
    JobStats, MAX_PAGE_LIMIT, ReclaimOutcome, STALE_RECLAIM_ERROR, StoreError,
};
pub use types::{
    BackoffStrategy, DeadLetterEntry, IngestionJob, JobId, JobStatus, JobTransition, RetryPolicy,
};
pub use worker::{IngestionWorker, WorkerConfig, WorkerHandle, WorkerStats};

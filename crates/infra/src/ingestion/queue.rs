//! The ingestion queue facade.
//!
//! Every operation asks the readiness gate first. A store that cannot be
//! reached surfaces as a value (`EnqueueResult` with a reason, or
//! [`IngestionError::Unavailable`]) instead of a panic or a hung call.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use leadflow_core::TenantId;
use leadflow_events::WebsiteEventEnvelope;

use super::dead_letter::{DeadLetterManager, RequeueBatchResult, RequeueSingleResult};
use super::enqueue::{EnqueueResult, Enqueuer};
use super::handler::HandlerRegistry;
use super::processor::{BatchProcessor, BatchResult, ProcessorConfig};
use super::readiness::{DEFAULT_READINESS_TIMEOUT, ReadinessGate, ReadinessReport};
use super::store::{DeadLetterFilter, IngestionStore, JobStats, ReclaimOutcome, StoreError};
use super::types::{DeadLetterEntry, IngestionJob, JobId, to_chrono};

/// Error returned by queue operations other than `enqueue`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    /// The store is unreachable; the report says why.
    #[error("ingestion unavailable: {0}")]
    Unavailable(ReadinessReport),
    #[error(transparent)]
    Store(StoreError),
}

impl IngestionError {
    /// Stable machine-readable code.
    pub fn reason(&self) -> &str {
        match self {
            IngestionError::Unavailable(report) => {
                report.reason.as_deref().unwrap_or("store_unavailable")
            }
            IngestionError::Store(StoreError::Corrupt(_)) => "corrupt_row",
            IngestionError::Store(_) => "store_error",
        }
    }
}

impl From<StoreError> for IngestionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => {
                IngestionError::Unavailable(ReadinessReport::unavailable(msg))
            }
            other => IngestionError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub processor: ProcessorConfig,
    pub readiness_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

/// Durable website event queue over an [`IngestionStore`].
#[derive(Debug, Clone)]
pub struct IngestionQueue<S> {
    store: S,
    gate: ReadinessGate,
    enqueuer: Enqueuer<S>,
    processor: BatchProcessor<S>,
    dead_letters: DeadLetterManager<S>,
}

impl<S> IngestionQueue<S>
where
    S: IngestionStore + Clone,
{
    pub fn new(store: S, handlers: HandlerRegistry, config: QueueConfig) -> Self {
        let gate = ReadinessGate::new(config.readiness_timeout);
        Self {
            enqueuer: Enqueuer::new(store.clone(), gate),
            processor: BatchProcessor::new(store.clone(), handlers, config.processor),
            dead_letters: DeadLetterManager::new(store.clone()),
            gate,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn is_ready(&self) -> ReadinessReport {
        self.gate.check(&self.store).await
    }

    async fn ensure_ready(&self) -> Result<(), IngestionError> {
        let report = self.is_ready().await;
        if report.ready {
            Ok(())
        } else {
            Err(IngestionError::Unavailable(report))
        }
    }

    pub async fn enqueue(&self, envelope: &WebsiteEventEnvelope) -> EnqueueResult {
        self.enqueuer.enqueue(envelope).await
    }

    pub async fn enqueue_at(
        &self,
        envelope: &WebsiteEventEnvelope,
        now: DateTime<Utc>,
    ) -> EnqueueResult {
        self.enqueuer.enqueue_at(envelope, now).await
    }

    pub async fn process_batch(&self, max_jobs: u32) -> Result<BatchResult, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.processor.process_batch(max_jobs).await?)
    }

    pub async fn process_batch_at(
        &self,
        now: DateTime<Utc>,
        max_jobs: u32,
    ) -> Result<BatchResult, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.processor.process_batch_at(now, max_jobs).await?)
    }

    pub async fn get_job_by_id(
        &self,
        job_id: JobId,
    ) -> Result<Option<IngestionJob>, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.store.get(job_id).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn schedule_now(&self, job_id: JobId) -> Result<bool, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.dead_letters.schedule_now(job_id).await?)
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.dead_letters.list(filter).await?)
    }

    pub async fn requeue_dead_letter(
        &self,
        job_id: JobId,
    ) -> Result<RequeueSingleResult, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.dead_letters.requeue_one(job_id).await?)
    }

    pub async fn requeue_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<RequeueBatchResult, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.dead_letters.requeue_batch(filter).await?)
    }

    pub async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, IngestionError> {
        self.ensure_ready().await?;
        Ok(self.store.stats(tenant_id).await?)
    }

    /// Release `processing` claims older than `older_than`.
    ///
    /// Uses the processor's retry budget to decide between requeue and
    /// dead letter.
    #[instrument(skip(self), err)]
    pub async fn reclaim_stale(
        &self,
        older_than: Duration,
    ) -> Result<ReclaimOutcome, IngestionError> {
        self.ensure_ready().await?;
        let now = Utc::now();
        let max_attempts = self.processor.config().retry_policy.max_attempts;
        Ok(self
            .store
            .reclaim_stale(now - to_chrono(older_than), max_attempts, now)
            .await?)
    }
}

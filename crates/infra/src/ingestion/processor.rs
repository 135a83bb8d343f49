//! Batch processor: claim, dispatch, commit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, info_span, warn};

use leadflow_events::parse_event;

use super::handler::{HandlerContext, HandlerRegistry};
use super::store::{IngestionStore, StoreError};
use super::types::{IngestionJob, JobTransition, RetryPolicy, to_chrono};

/// Default per-job handler timeout.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which a `processing` claim is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Error recorded when a handler overruns its timeout.
pub const HANDLER_TIMEOUT_ERROR: &str = "handler_timeout";

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub retry_policy: RetryPolicy,
    pub handler_timeout: Duration,
    /// `None` disables the stale-claim sweep. Must exceed `handler_timeout`:
    /// a claim is refreshed right before its dispatch, not during it.
    pub stale_after: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            stale_after: Some(DEFAULT_STALE_AFTER),
        }
    }
}

/// Counters for one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub picked_count: u32,
    pub processed_count: u32,
    /// Jobs that failed for good (dead-lettered) in this batch.
    pub failed_count: u32,
    pub requeued_count: u32,
    pub dead_lettered_count: u32,
    /// Stale claims released before claiming.
    pub reclaimed_count: u32,
    /// Outcomes that could not be written back.
    pub commit_failed_count: u32,
    /// Claimed jobs not dispatched because the claim was lost while they waited.
    pub lost_claim_count: u32,
}

/// Runs claimed jobs through their handlers.
#[derive(Debug, Clone)]
pub struct BatchProcessor<S> {
    store: S,
    handlers: HandlerRegistry,
    config: ProcessorConfig,
}

impl<S> BatchProcessor<S>
where
    S: IngestionStore,
{
    pub fn new(store: S, handlers: HandlerRegistry, config: ProcessorConfig) -> Self {
        Self {
            store,
            handlers,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub async fn process_batch(&self, max_jobs: u32) -> Result<BatchResult, StoreError> {
        self.run(Utc::now(), max_jobs, Utc::now).await
    }

    /// Process with a frozen clock: claim, backoff, and commits all use `now`.
    pub async fn process_batch_at(
        &self,
        now: DateTime<Utc>,
        max_jobs: u32,
    ) -> Result<BatchResult, StoreError> {
        self.run(now, max_jobs, move || now).await
    }

    async fn run(
        &self,
        now: DateTime<Utc>,
        max_jobs: u32,
        clock: impl Fn() -> DateTime<Utc>,
    ) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();

        if let Some(stale_after) = self.config.stale_after {
            let cutoff = now - to_chrono(stale_after);
            let reclaimed = self
                .store
                .reclaim_stale(cutoff, self.config.retry_policy.max_attempts, now)
                .await?;
            if reclaimed.total() > 0 {
                warn!(
                    requeued = reclaimed.requeued,
                    dead_lettered = reclaimed.dead_lettered,
                    "reclaimed stale processing jobs"
                );
            }
            result.reclaimed_count = saturating_u32(reclaimed.total());
        }

        let jobs = self.store.claim_batch(now, max_jobs).await?;
        result.picked_count = saturating_u32(jobs.len() as u64);

        for job in jobs {
            let span = info_span!(
                "ingestion_job",
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                event_type = %job.event_type,
                attempt = job.attempt_count,
            );
            self.process_one(job, &clock, &mut result)
                .instrument(span)
                .await;
        }

        if result.picked_count > 0 {
            info!(
                picked = result.picked_count,
                processed = result.processed_count,
                requeued = result.requeued_count,
                dead_lettered = result.dead_lettered_count,
                commit_failed = result.commit_failed_count,
                lost_claim = result.lost_claim_count,
                "ingestion batch finished"
            );
        }
        Ok(result)
    }

    async fn process_one(
        &self,
        job: IngestionJob,
        clock: &impl Fn() -> DateTime<Utc>,
        result: &mut BatchResult,
    ) {
        let attempt = job.attempt_count;

        // Jobs wait their turn behind the rest of the batch; restart the
        // stale timer so a concurrent sweep does not hand this one out again.
        match self.store.touch(job.id, attempt, clock()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("claim lost before dispatch, job skipped");
                result.lost_claim_count += 1;
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to refresh claim, job skipped");
                result.lost_claim_count += 1;
                return;
            }
        }

        let outcome = self.dispatch(&job).await;
        let now = clock();
        let policy = &self.config.retry_policy;

        let transition = match outcome {
            Ok(()) => JobTransition::Processed,
            Err(error) if policy.should_retry(attempt) => {
                let next_attempt_at = policy.next_attempt_at(attempt, now);
                warn!(%error, %next_attempt_at, "ingestion job failed, will retry");
                JobTransition::Retry {
                    error,
                    next_attempt_at,
                }
            }
            Err(error) => {
                warn!(%error, "ingestion job failed, moving to dead letter");
                JobTransition::DeadLetter { error }
            }
        };

        match self.store.transition(job.id, attempt, &transition, now).await {
            Ok(true) => match transition {
                JobTransition::Processed => result.processed_count += 1,
                JobTransition::Retry { .. } => result.requeued_count += 1,
                JobTransition::DeadLetter { .. } => {
                    result.dead_lettered_count += 1;
                    result.failed_count += 1;
                }
            },
            Ok(false) => {
                warn!("claim lost before commit, outcome discarded");
                result.commit_failed_count += 1;
            }
            Err(err) => {
                error!(error = %err, "failed to commit ingestion job outcome");
                result.commit_failed_count += 1;
            }
        }
    }

    /// Run the handler for one claimed job; `Err` carries the `last_error` text.
    async fn dispatch(&self, job: &IngestionJob) -> Result<(), String> {
        let event = parse_event(&job.event_type, job.event_version, &job.payload)
            .map_err(|e| e.to_string())?;

        let handler = self
            .handlers
            .for_event(&event)
            .ok_or_else(|| format!("no_handler: {}", job.event_type))?;

        let ctx = HandlerContext {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            event_key: job.event_key.clone(),
            attempt: job.attempt_count,
            occurred_at: job.occurred_at,
        };

        // A spawned task turns handler panics into a failed attempt.
        let task = tokio::spawn(
            async move { handler.handle(&ctx, &event).await }.in_current_span(),
        );
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.handler_timeout, task).await {
            Ok(Ok(Ok(()))) => {
                debug!("handler succeeded");
                Ok(())
            }
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => Err("handler_panicked".to_string()),
            Ok(Err(join_err)) => Err(format!("handler_aborted: {join_err}")),
            Err(_) => {
                abort.abort();
                Err(HANDLER_TIMEOUT_ERROR.to_string())
            }
        }
    }
}

fn saturating_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

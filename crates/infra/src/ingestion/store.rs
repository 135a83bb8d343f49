//! Ingestion job storage: the store boundary and the in-memory backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::TenantId;

use super::types::{DeadLetterEntry, IngestionJob, JobId, JobStatus, JobTransition};

/// Default page size for dead-letter listings.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Hard cap on a single dead-letter page.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Ingestion store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of an insert attempt against the `(tenant_id, event_key)` constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(JobId),
    /// A job with the same tenant and key exists already.
    Duplicate(JobId),
}

/// Filter + page for dead-letter queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterFilter {
    /// `None` selects the global feed across tenants.
    pub tenant_id: Option<TenantId>,
    pub limit: u32,
    pub offset: u32,
    pub include_payload: bool,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            tenant_id: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
            include_payload: false,
        }
    }
}

impl DeadLetterFilter {
    pub fn new(tenant_id: Option<TenantId>, limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            tenant_id,
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
            include_payload: false,
        }
    }

    pub fn with_payload(mut self, include_payload: bool) -> Self {
        self.include_payload = include_payload;
        self
    }

    /// Limit clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    fn matches(&self, job: &IngestionJob) -> bool {
        job.status == JobStatus::DeadLetter
            && self.tenant_id.as_ref().is_none_or(|t| &job.tenant_id == t)
    }
}

/// Jobs moved out of `processing` by a stale-claim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimOutcome {
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ReclaimOutcome {
    pub fn total(&self) -> u64 {
        self.requeued + self.dead_lettered
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl JobStats {
    fn bump(&mut self, status: JobStatus, by: u64) {
        match status {
            JobStatus::Pending => self.pending += by,
            JobStatus::Processing => self.processing += by,
            JobStatus::Processed => self.processed += by,
            JobStatus::Failed => self.failed += by,
            JobStatus::DeadLetter => self.dead_letter += by,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.processed + self.failed + self.dead_letter
    }
}

/// Error text written to jobs moved out of a stale claim.
pub const STALE_RECLAIM_ERROR: &str = "stale_processing_reclaimed";

/// Ingestion job store abstraction.
///
/// Every state change is a conditional write: implementations must apply the
/// predicate and the update atomically, so concurrent workers and operators
/// never observe or produce a half-applied transition.
#[async_trait]
pub trait IngestionStore: Send + Sync {
    /// Cheap round-trip proving the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a new job unless `(tenant_id, event_key)` is taken.
    async fn try_insert(&self, job: IngestionJob) -> Result<InsertOutcome, StoreError>;

    /// Atomically claim up to `limit` due pending jobs.
    ///
    /// Claimed jobs are `processing` with `attempt_count` incremented and are
    /// returned oldest-due first.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>, StoreError>;

    /// Record the outcome of a claimed attempt.
    ///
    /// Applies only while the job is still `processing` at `attempt`; returns
    /// `false` when the claim was lost (e.g. reclaimed as stale).
    async fn transition(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Refresh `updated_at` of a claim that is about to be dispatched.
    ///
    /// Same predicate as [`transition`](Self::transition): `false` means the
    /// claim was lost and the job must not be dispatched.
    async fn touch(&self, job_id: JobId, attempt: u32, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<IngestionJob>, StoreError>;

    /// Dead-lettered jobs, newest dead-letter first.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// `dead_letter → pending`, due now. `false` if the job is not dead-lettered.
    async fn requeue_dead_letter(&self, job_id: JobId, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Set `next_attempt_at = now` on a non-terminal job without touching its status.
    ///
    /// `updated_at` of a `processing` job is left alone so a stuck claim still
    /// ages towards stale reclaim.
    async fn schedule_now(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Release `processing` jobs not updated since `cutoff`.
    ///
    /// Jobs with budget left go back to `pending` (due now), the rest to
    /// `dead_letter`.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReclaimOutcome, StoreError>;

    /// Job counts per status, optionally for one tenant.
    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, StoreError>;
}

#[async_trait]
impl<S> IngestionStore for Arc<S>
where
    S: IngestionStore + ?Sized,
{
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn try_insert(&self, job: IngestionJob) -> Result<InsertOutcome, StoreError> {
        (**self).try_insert(job).await
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>, StoreError> {
        (**self).claim_batch(now, limit).await
    }

    async fn transition(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).transition(job_id, attempt, transition, now).await
    }

    async fn touch(
        &self,
        job_id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).touch(job_id, attempt, now).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        (**self).get(job_id).await
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).list_dead_letters(filter).await
    }

    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).requeue_dead_letter(job_id, now).await
    }

    async fn schedule_now(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).schedule_now(job_id, now).await
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReclaimOutcome, StoreError> {
        (**self).reclaim_stale(cutoff, max_attempts, now).await
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, StoreError> {
        (**self).stats(tenant_id).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, IngestionJob>,
    keys: HashMap<(TenantId, String), JobId>,
}

/// In-memory ingestion store for tests/dev.
///
/// A single mutex guards jobs and the key index, so every operation is one
/// critical section (the claim included).
#[derive(Debug)]
pub struct InMemoryIngestionStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl InMemoryIngestionStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with `Unavailable` while unset.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored jobs (any status).
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryIngestionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestionStore for InMemoryIngestionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn try_insert(&self, job: IngestionJob) -> Result<InsertOutcome, StoreError> {
        let mut state = self.lock()?;
        let key = (job.tenant_id.clone(), job.event_key.clone());
        if let Some(existing) = state.keys.get(&key) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }
        let id = job.id;
        state.keys.insert(key, id);
        state.jobs.insert(id, job);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>, StoreError> {
        let mut state = self.lock()?;

        let mut due: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| (j.next_attempt_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.mark_processing(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: &JobTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing && job.attempt_count == attempt => {
                job.apply(transition, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(
        &self,
        job_id: JobId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing && job.attempt_count == attempt => {
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.lock()?;
        let mut result: Vec<&IngestionJob> =
            state.jobs.values().filter(|j| filter.matches(j)).collect();

        result.sort_by(|a, b| {
            b.dead_lettered_at
                .cmp(&a.dead_lettered_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(result
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.effective_limit() as usize)
            .map(|j| j.to_dead_letter_entry(filter.include_payload))
            .collect())
    }

    async fn requeue_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::DeadLetter => {
                job.mark_requeued(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_now(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.next_attempt_at = now;
                if job.status == JobStatus::Pending {
                    job.updated_at = now;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReclaimOutcome, StoreError> {
        let mut state = self.lock()?;
        let mut outcome = ReclaimOutcome::default();

        for job in state.jobs.values_mut() {
            if job.status != JobStatus::Processing || job.updated_at >= cutoff {
                continue;
            }
            let error = STALE_RECLAIM_ERROR.to_string();
            if job.attempt_count >= max_attempts {
                job.apply(&JobTransition::DeadLetter { error }, now);
                outcome.dead_lettered += 1;
            } else {
                job.apply(
                    &JobTransition::Retry {
                        error,
                        next_attempt_at: now,
                    },
                    now,
                );
                outcome.requeued += 1;
            }
        }

        Ok(outcome)
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, StoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            if tenant_id.is_none_or(|t| &job.tenant_id == t) {
                stats.bump(job.status, 1);
            }
        }
        Ok(stats)
    }
}

/// Status counts from `(status, count)` rows, as returned by SQL backends.
pub(crate) fn stats_from_counts(
    rows: impl IntoIterator<Item = (JobStatus, u64)>,
) -> JobStats {
    let mut stats = JobStats::default();
    for (status, count) in rows {
        stats.bump(status, count);
    }
    stats
}

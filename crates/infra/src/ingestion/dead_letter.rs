//! Operator-facing dead-letter inspection and requeue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::store::{DeadLetterFilter, IngestionStore, StoreError};
use super::types::{DeadLetterEntry, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueSingleResult {
    pub job_id: JobId,
    /// `false` when the job does not exist or is not dead-lettered.
    pub requeued: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueBatchResult {
    pub requeued_count: u32,
    /// Listed jobs that left `dead_letter` before their requeue landed, or
    /// whose requeue failed in the store.
    pub skipped_count: u32,
}

/// Lists and requeues dead-lettered jobs.
#[derive(Debug, Clone)]
pub struct DeadLetterManager<S> {
    store: S,
}

impl<S> DeadLetterManager<S>
where
    S: IngestionStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn list(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store.list_dead_letters(filter).await
    }

    pub async fn requeue_one(&self, job_id: JobId) -> Result<RequeueSingleResult, StoreError> {
        self.requeue_one_at(job_id, Utc::now()).await
    }

    #[instrument(skip(self), err)]
    pub async fn requeue_one_at(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<RequeueSingleResult, StoreError> {
        let requeued = self.store.requeue_dead_letter(job_id, now).await?;
        if requeued {
            info!("dead-lettered job requeued");
        } else {
            debug!("job not in dead letter, nothing to requeue");
        }
        Ok(RequeueSingleResult { job_id, requeued })
    }

    pub async fn requeue_batch(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<RequeueBatchResult, StoreError> {
        self.requeue_batch_at(filter, Utc::now()).await
    }

    /// Requeue one page of dead letters.
    ///
    /// The page is listed first; entries that were requeued or otherwise moved
    /// in the meantime are counted as skipped. A store error on one entry skips
    /// that entry only, so the counts always describe what actually moved.
    #[instrument(skip(self), fields(tenant_id = ?filter.tenant_id), err)]
    pub async fn requeue_batch_at(
        &self,
        filter: &DeadLetterFilter,
        now: DateTime<Utc>,
    ) -> Result<RequeueBatchResult, StoreError> {
        let page = filter.clone().with_payload(false);
        let entries = self.store.list_dead_letters(&page).await?;

        let mut result = RequeueBatchResult::default();
        for entry in entries {
            match self.store.requeue_dead_letter(entry.id, now).await {
                Ok(true) => result.requeued_count += 1,
                Ok(false) => result.skipped_count += 1,
                Err(err) => {
                    warn!(job_id = %entry.id, error = %err, "requeue failed, entry skipped");
                    result.skipped_count += 1;
                }
            }
        }

        info!(
            requeued = result.requeued_count,
            skipped = result.skipped_count,
            "dead-letter batch requeued"
        );
        Ok(result)
    }

    /// Make a pending or processing job due now. `false` for terminal or unknown jobs.
    pub async fn schedule_now(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.store.schedule_now(job_id, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::store::{InMemoryIngestionStore, InsertOutcome, JobStats, ReclaimOutcome};
    use crate::ingestion::types::{IngestionJob, JobStatus, JobTransition};
    use async_trait::async_trait;
    use leadflow_core::TenantId;
    use leadflow_events::WebsiteEventEnvelope;
    use serde_json::json;
    use std::sync::Arc;

    /// In-memory store whose requeue of one particular job always errors.
    struct FailingRequeue {
        inner: Arc<InMemoryIngestionStore>,
        broken: JobId,
    }

    #[async_trait]
    impl IngestionStore for FailingRequeue {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn try_insert(&self, job: IngestionJob) -> Result<InsertOutcome, StoreError> {
            self.inner.try_insert(job).await
        }

        async fn claim_batch(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> Result<Vec<IngestionJob>, StoreError> {
            self.inner.claim_batch(now, limit).await
        }

        async fn transition(
            &self,
            job_id: JobId,
            attempt: u32,
            transition: &JobTransition,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.transition(job_id, attempt, transition, now).await
        }

        async fn touch(
            &self,
            job_id: JobId,
            attempt: u32,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.touch(job_id, attempt, now).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<IngestionJob>, StoreError> {
            self.inner.get(job_id).await
        }

        async fn list_dead_letters(
            &self,
            filter: &DeadLetterFilter,
        ) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.inner.list_dead_letters(filter).await
        }

        async fn requeue_dead_letter(
            &self,
            job_id: JobId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            if job_id == self.broken {
                return Err(StoreError::Storage("row locked".into()));
            }
            self.inner.requeue_dead_letter(job_id, now).await
        }

        async fn schedule_now(
            &self,
            job_id: JobId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.schedule_now(job_id, now).await
        }

        async fn reclaim_stale(
            &self,
            cutoff: DateTime<Utc>,
            max_attempts: u32,
            now: DateTime<Utc>,
        ) -> Result<ReclaimOutcome, StoreError> {
            self.inner.reclaim_stale(cutoff, max_attempts, now).await
        }

        async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<JobStats, StoreError> {
            self.inner.stats(tenant_id).await
        }
    }

    async fn dead_letter(
        store: &InMemoryIngestionStore,
        tenant: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> JobId {
        let envelope = WebsiteEventEnvelope::new(
            "lead.submitted",
            1,
            at,
            TenantId::new(tenant).unwrap(),
            json!({}),
        );
        let job = IngestionJob::new_pending(&envelope, key, at);
        let id = job.id;
        store.try_insert(job).await.unwrap();
        store.claim_batch(at, 1).await.unwrap();
        let error = "invalid_payload: email".to_string();
        assert!(
            store
                .transition(id, 1, &JobTransition::DeadLetter { error }, at)
                .await
                .unwrap()
        );
        id
    }

    #[tokio::test]
    async fn requeue_one_is_conditional_on_dead_letter() {
        let store = InMemoryIngestionStore::arc();
        let now = Utc::now();
        let id = dead_letter(&store, "acme", "k", now).await;
        let manager = DeadLetterManager::new(store.clone());

        assert!(manager.requeue_one(id).await.unwrap().requeued);
        assert!(!manager.requeue_one(id).await.unwrap().requeued);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.dead_lettered_at.is_none());
        assert_eq!(job.attempt_count, 1);
        assert!(job.last_error.is_some());
    }

    #[tokio::test]
    async fn batch_requeue_honours_tenant_and_page() {
        let store = InMemoryIngestionStore::arc();
        let base = Utc::now();
        for i in 0..3 {
            let at = base + chrono::Duration::seconds(i);
            dead_letter(&store, "acme", &format!("a{i}"), at).await;
        }
        dead_letter(&store, "globex", "g", base).await;
        let manager = DeadLetterManager::new(Arc::clone(&store));

        let acme = DeadLetterFilter::new(Some(TenantId::new("acme").unwrap()), Some(2), None);
        let result = manager.requeue_batch(&acme).await.unwrap();
        assert_eq!(
            result,
            RequeueBatchResult {
                requeued_count: 2,
                skipped_count: 0
            }
        );

        let remaining = manager.list(&DeadLetterFilter::default()).await.unwrap();
        let tenants: Vec<_> = remaining.iter().map(|e| e.tenant_id.as_str()).collect();
        assert_eq!(tenants.len(), 2);
        assert!(tenants.contains(&"globex"));
        // Newest acme entries went first; the oldest is still there.
        assert!(remaining.iter().any(|e| e.event_key == "a0"));
    }

    #[tokio::test]
    async fn one_failing_requeue_does_not_hide_the_others() {
        let store = InMemoryIngestionStore::arc();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let at = base + chrono::Duration::seconds(i);
            ids.push(dead_letter(&store, "acme", &format!("a{i}"), at).await);
        }
        // Newest first: the broken job sits in the middle of the page.
        let manager = DeadLetterManager::new(FailingRequeue {
            inner: Arc::clone(&store),
            broken: ids[1],
        });

        let result = manager
            .requeue_batch(&DeadLetterFilter::default())
            .await
            .unwrap();
        assert_eq!(
            result,
            RequeueBatchResult {
                requeued_count: 2,
                skipped_count: 1
            }
        );

        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(
            store.get(ids[1]).await.unwrap().unwrap().status,
            JobStatus::DeadLetter
        );
    }
}

//! Idempotent enqueue of website events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use leadflow_events::{WebsiteEventEnvelope, derive_event_key, validate};

use super::readiness::ReadinessGate;
use super::store::{IngestionStore, InsertOutcome, StoreError};
use super::types::{IngestionJob, JobId};

/// Why an event was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueRejection {
    /// The readiness gate reported the store unreachable.
    StoreUnavailable,
    /// The insert failed for any other reason.
    EnqueueFailed,
}

impl EnqueueRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueRejection::StoreUnavailable => "store_unavailable",
            EnqueueRejection::EnqueueFailed => "enqueue_failed",
        }
    }
}

impl core::fmt::Display for EnqueueRejection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `enqueue`. Never an error: callers branch on the flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResult {
    pub accepted: bool,
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EnqueueRejection>,
}

impl EnqueueResult {
    fn accepted(job_id: JobId, event_key: String, duplicate: bool) -> Self {
        Self {
            accepted: true,
            duplicate,
            job_id: Some(job_id),
            event_key: Some(event_key),
            reason: None,
        }
    }

    fn rejected(reason: EnqueueRejection, event_key: Option<String>) -> Self {
        Self {
            accepted: false,
            duplicate: false,
            job_id: None,
            event_key,
            reason: Some(reason),
        }
    }
}

/// Turns envelopes into pending jobs, at most one per `(tenant, event key)`.
#[derive(Debug, Clone)]
pub struct Enqueuer<S> {
    store: S,
    gate: ReadinessGate,
}

impl<S> Enqueuer<S>
where
    S: IngestionStore,
{
    pub fn new(store: S, gate: ReadinessGate) -> Self {
        Self { store, gate }
    }

    pub async fn enqueue(&self, envelope: &WebsiteEventEnvelope) -> EnqueueResult {
        self.enqueue_at(envelope, Utc::now()).await
    }

    /// Enqueue with an explicit clock.
    ///
    /// Invalid events are persisted anyway: they are retried and end up in
    /// the dead-letter queue, where an operator can see them.
    #[instrument(
        skip(self, envelope),
        fields(tenant_id = %envelope.tenant_id(), event_type = %envelope.event_type())
    )]
    pub async fn enqueue_at(
        &self,
        envelope: &WebsiteEventEnvelope,
        now: DateTime<Utc>,
    ) -> EnqueueResult {
        let report = self.gate.check(&self.store).await;
        if !report.ready {
            warn!(message = %report.message, "enqueue rejected: store not ready");
            return EnqueueResult::rejected(EnqueueRejection::StoreUnavailable, None);
        }

        if let Err(err) = validate(envelope) {
            warn!(error = %err, "enqueuing invalid website event");
        }

        let event_key = derive_event_key(envelope);
        let job = IngestionJob::new_pending(envelope, event_key.clone(), now);

        match self.store.try_insert(job).await {
            Ok(InsertOutcome::Inserted(job_id)) => {
                info!(%job_id, %event_key, "website event enqueued");
                EnqueueResult::accepted(job_id, event_key, false)
            }
            Ok(InsertOutcome::Duplicate(job_id)) => {
                debug!(%job_id, %event_key, "duplicate website event");
                EnqueueResult::accepted(job_id, event_key, true)
            }
            Err(StoreError::Unavailable(msg)) => {
                warn!(error = %msg, "enqueue failed: store unavailable");
                EnqueueResult::rejected(EnqueueRejection::StoreUnavailable, Some(event_key))
            }
            Err(err) => {
                error!(error = %err, "enqueue failed");
                EnqueueResult::rejected(EnqueueRejection::EnqueueFailed, Some(event_key))
            }
        }
    }
}

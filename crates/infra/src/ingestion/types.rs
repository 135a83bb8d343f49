//! Core ingestion job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use leadflow_core::TenantId;
use leadflow_events::WebsiteEventEnvelope;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job lifecycle status.
///
/// `pending → processing → {processed | pending (retry) | dead_letter}`;
/// only a requeue moves `dead_letter` back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_attempt_at` to pass
    Pending,
    /// Claimed by a worker
    Processing,
    /// Handler succeeded
    Processed,
    /// Reserved in the schema; no transition writes it
    Failed,
    /// Retry budget exhausted, parked for an operator
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Processed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Processed | JobStatus::Failed | JobStatus::DeadLetter
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid job status: {s}"))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// Delays are monotonically non-decreasing in the attempt number and capped at
/// `max_delay`, so persistently failing jobs drift to the back of the queue
/// instead of being reclaimed on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a job is dead-lettered (at least 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay after the given attempt (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // 2^63 already saturates any realistic base.
                let exp = (attempt - 1).min(63);
                base_ms.saturating_mul(1u64 << exp)
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
        };

        Duration::from_millis(delay_ms.min(max_ms.max(base_ms)))
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// When a job that just failed its `attempt`-th attempt becomes due again.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.delay_for_attempt(attempt))
    }
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// A durable ingestion job: one website event on its way into the CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub event_version: u32,
    /// Idempotency key, unique per tenant
    pub event_key: String,
    /// Business time reported by the producer
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Attempts made so far; bumped by each claim
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed again
    pub next_attempt_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    /// Create a new pending job, due immediately.
    pub fn new_pending(
        envelope: &WebsiteEventEnvelope,
        event_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: envelope.tenant_id().clone(),
            event_type: envelope.event_type().to_string(),
            event_version: envelope.version(),
            event_key: event_key.into(),
            occurred_at: envelope.occurred_at(),
            payload: envelope.payload().clone(),
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            processed_at: None,
            dead_lettered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_attempt_at <= now
    }

    /// Mark job as claimed (counts the attempt).
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempt_count += 1;
        self.updated_at = now;
    }

    /// Record the outcome of the current attempt.
    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) {
        match transition {
            JobTransition::Processed => {
                self.status = JobStatus::Processed;
                self.processed_at = Some(now);
            }
            JobTransition::Retry {
                error,
                next_attempt_at,
            } => {
                self.status = JobStatus::Pending;
                self.last_error = Some(error.clone());
                self.next_attempt_at = (*next_attempt_at).max(now);
            }
            JobTransition::DeadLetter { error } => {
                self.status = JobStatus::DeadLetter;
                self.last_error = Some(error.clone());
                self.dead_lettered_at = Some(now);
            }
        }
        self.updated_at = now;
    }

    /// Move a dead-lettered job back to pending, due now.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.dead_lettered_at = None;
        self.next_attempt_at = now;
        self.updated_at = now;
    }

    /// View of the job for dead-letter listings.
    pub fn to_dead_letter_entry(&self, include_payload: bool) -> DeadLetterEntry {
        DeadLetterEntry {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            event_type: self.event_type.clone(),
            event_key: self.event_key.clone(),
            occurred_at: self.occurred_at,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            dead_lettered_at: self.dead_lettered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            payload: include_payload.then(|| self.payload.clone()),
        }
    }
}

/// Outcome written back for a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    /// Handler succeeded
    Processed,
    /// Failed, retry budget left
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Failed, retry budget exhausted
    DeadLetter { error: String },
}

impl JobTransition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobTransition::Processed => JobStatus::Processed,
            JobTransition::Retry { .. } => JobStatus::Pending,
            JobTransition::DeadLetter { .. } => JobStatus::DeadLetter,
        }
    }
}

/// Entry in a dead-letter listing.
///
/// The payload is only present when the caller asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub event_key: String,
    pub occurred_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

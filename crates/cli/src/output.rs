//! JSON documents printed by the CLI, one per invocation.

use serde::Serialize;

use leadflow_core::TenantId;
use leadflow_infra::ConfigError;
use leadflow_infra::ingestion::{
    DeadLetterEntry, IngestionError, IngestionJob, JobId, JobStats, MigrationError, StoreError,
};

/// Successful command result; `event` names the variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CommandOutput {
    #[serde(rename_all = "camelCase")]
    DeadLetterListResult {
        tenant_id: Option<TenantId>,
        limit: u32,
        offset: u32,
        count: usize,
        include_payload: bool,
        jobs: Vec<DeadLetterEntry>,
    },
    #[serde(rename_all = "camelCase")]
    DeadLetterRequeueSingleResult { job_id: JobId, requeued: bool },
    #[serde(rename_all = "camelCase")]
    DeadLetterRequeueBatchResult {
        tenant_id: Option<TenantId>,
        limit: u32,
        offset: u32,
        requeued_count: u32,
        skipped_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    JobGetResult {
        job_id: JobId,
        found: bool,
        job: Option<IngestionJob>,
    },
    #[serde(rename_all = "camelCase")]
    JobScheduleNowResult { job_id: JobId, scheduled: bool },
    #[serde(rename_all = "camelCase")]
    JobStatsResult {
        tenant_id: Option<TenantId>,
        total: u64,
        stats: JobStats,
    },
    #[serde(rename_all = "camelCase")]
    StaleReclaimResult {
        older_than_secs: u64,
        requeued: u64,
        dead_lettered: u64,
    },
    #[serde(rename_all = "camelCase")]
    MigrateResult { applied: usize, current_version: i64 },
}

/// Failure line written to stderr; the process exits with status 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename = "command_failed", rename_all = "camelCase")]
pub struct CommandFailed {
    pub command: String,
    pub reason: String,
    pub message: String,
}

/// Infrastructure failure while running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub reason: String,
    pub message: String,
}

impl CommandError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Wrap an error chain, keeping every context layer in the message.
    pub fn from_anyhow(reason: &str, err: anyhow::Error) -> Self {
        Self::new(reason, format!("{err:#}"))
    }

    pub fn into_failed(self, command: &str) -> CommandFailed {
        CommandFailed {
            command: command.to_string(),
            reason: self.reason,
            message: self.message,
        }
    }
}

impl From<IngestionError> for CommandError {
    fn from(err: IngestionError) -> Self {
        let message = match &err {
            IngestionError::Unavailable(report) => report.message.clone(),
            IngestionError::Store(store) => store.to_string(),
        };
        Self::new(err.reason(), message)
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        IngestionError::from(err).into()
    }
}

impl From<ConfigError> for CommandError {
    fn from(err: ConfigError) -> Self {
        let reason = match err {
            ConfigError::Missing(_) => "config_missing",
            ConfigError::Invalid { .. } => "config_invalid",
        };
        Self::new(reason, err.to_string())
    }
}

impl From<MigrationError> for CommandError {
    fn from(err: MigrationError) -> Self {
        Self::new("migration_failed", err.to_string())
    }
}


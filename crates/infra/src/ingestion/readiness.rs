//! Runtime readiness gate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store::{IngestionStore, StoreError};

/// Reason code reported while the store cannot be reached.
pub const STORE_UNAVAILABLE: &str = "store_unavailable";

/// Default bound on a readiness ping.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Structured answer to "can the queue serve requests right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

impl ReadinessReport {
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
            message: "ingestion store reachable".to_string(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(STORE_UNAVAILABLE.to_string()),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{reason}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Pings the store under a timeout.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessGate {
    timeout: Duration,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(DEFAULT_READINESS_TIMEOUT)
    }
}

impl ReadinessGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check<S>(&self, store: &S) -> ReadinessReport
    where
        S: IngestionStore + ?Sized,
    {
        match tokio::time::timeout(self.timeout, store.ping()).await {
            Ok(Ok(())) => ReadinessReport::ready(),
            Ok(Err(err)) => {
                warn!(error = %err, "ingestion store not ready");
                ReadinessReport::unavailable(describe(&err))
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "ingestion store ping timed out"
                );
                ReadinessReport::unavailable(format!(
                    "store ping exceeded {} ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

fn describe(err: &StoreError) -> String {
    match err {
        StoreError::Unavailable(msg) => msg.clone(),
        other => other.to_string(),
    }
}

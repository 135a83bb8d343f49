//! Background polling loop around [`IngestionQueue::process_batch`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::queue::{IngestionError, IngestionQueue};
use super::store::IngestionStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Jobs claimed per batch
    pub batch_size: u32,
    /// Sleep between polls when the queue is drained
    pub poll_interval: Duration,
    /// Sleep after the store reported unavailable
    pub unavailable_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "ingestion-worker".to_string(),
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            unavailable_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Totals since the worker started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub batches: u64,
    pub picked: u64,
    pub processed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reclaimed: u64,
    pub commit_failed: u64,
    pub unavailable_polls: u64,
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "ingestion worker task failed");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Polls the queue until shut down.
///
/// A batch is never interrupted; shutdown is observed between batches and
/// during sleeps. Full batches are followed immediately by another poll.
#[derive(Debug)]
pub struct IngestionWorker;

impl IngestionWorker {
    pub fn spawn<S>(queue: Arc<IngestionQueue<S>>, config: WorkerConfig) -> WorkerHandle
    where
        S: IngestionStore + Clone + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(worker_loop(
            queue,
            config,
            shutdown_rx,
            Arc::clone(&stats),
        ));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop<S>(
    queue: Arc<IngestionQueue<S>>,
    config: WorkerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: IngestionStore + Clone + 'static,
{
    let name = config.name.as_str();
    info!(worker = name, batch_size = config.batch_size, "ingestion worker started");

    while !*shutdown_rx.borrow() {
        let pause = match queue.process_batch(config.batch_size).await {
            Ok(batch) => {
                if let Ok(mut s) = stats.lock() {
                    s.batches += 1;
                    s.picked += u64::from(batch.picked_count);
                    s.processed += u64::from(batch.processed_count);
                    s.requeued += u64::from(batch.requeued_count);
                    s.dead_lettered += u64::from(batch.dead_lettered_count);
                    s.reclaimed += u64::from(batch.reclaimed_count);
                    s.commit_failed += u64::from(batch.commit_failed_count);
                }
                if batch.picked_count >= config.batch_size {
                    continue;
                }
                config.poll_interval
            }
            Err(IngestionError::Unavailable(report)) => {
                warn!(worker = name, reason = %report, "ingestion store unavailable");
                if let Ok(mut s) = stats.lock() {
                    s.unavailable_polls += 1;
                }
                config.unavailable_backoff
            }
            Err(err) => {
                error!(worker = name, error = %err, "ingestion batch failed");
                config.poll_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker = name, "ingestion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::handler::{EventHandler, HandlerContext, HandlerError, HandlerRegistry};
    use crate::config::IngestionConfig;
    use crate::ingestion::store::InMemoryIngestionStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use leadflow_core::TenantId;
    use leadflow_events::{LEAD_SUBMITTED, WebsiteEvent, WebsiteEventEnvelope};
    use serde_json::json;

    struct Succeed;

    #[async_trait]
    impl EventHandler for Succeed {
        async fn handle(&self, _: &HandlerContext, _: &WebsiteEvent) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_the_queue_and_stops_on_shutdown() {
        let settings = IngestionConfig {
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            ..IngestionConfig::default()
        };
        let store = InMemoryIngestionStore::arc();
        let handlers = HandlerRegistry::new().with(LEAD_SUBMITTED, Succeed);
        let queue = Arc::new(IngestionQueue::new(
            store.clone(),
            handlers,
            settings.queue_config(),
        ));

        for i in 0..5 {
            let envelope = WebsiteEventEnvelope::new(
                LEAD_SUBMITTED,
                1,
                Utc::now(),
                TenantId::new("acme").unwrap(),
                json!({ "email": format!("lead{i}@example.com") }),
            );
            assert!(queue.enqueue(&envelope).await.accepted);
        }

        let config = settings.worker_config().with_name("test-worker");
        assert_eq!(config.batch_size, 2);
        let handle = IngestionWorker::spawn(Arc::clone(&queue), config);

        for _ in 0..100 {
            if handle.stats().processed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handle.stats().processed, 5);
        handle.shutdown().await;
        assert_eq!(store.stats(None).await.unwrap().processed, 5);
    }
}

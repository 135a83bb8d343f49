//! End-to-end scenarios for the in-memory ingestion pipeline.
//!
//! Tests: enqueue → claim → handler → retry/dead letter → requeue
//!
//! Verifies:
//! - Enqueue is idempotent per tenant and event key
//! - Invalid events spend exactly the retry budget before dead-lettering
//! - Concurrent batch callers never dispatch a job twice
//! - Dead-letter listing and requeue respect tenant scope

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};

    use leadflow_core::TenantId;
    use leadflow_events::{
        LEAD_SUBMITTED, VALUATION_REQUESTED, WebsiteEvent, WebsiteEventEnvelope,
    };

    use crate::ingestion::{
        DeadLetterFilter, EventHandler, HandlerContext, HandlerError, HandlerRegistry,
        InMemoryIngestionStore, IngestionQueue, JobId, JobStatus, ProcessorConfig, QueueConfig,
        RequeueBatchResult, RetryPolicy,
    };

    type MemoryQueue = IngestionQueue<Arc<InMemoryIngestionStore>>;

    const MAX_ATTEMPTS: u32 = 3;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    /// Mid-bucket occurrence time, so repeated submissions share a bucket.
    fn occurred_at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_900, 0).unwrap()
    }

    fn envelope(tenant_id: &str, event_type: &str, payload: Value) -> WebsiteEventEnvelope {
        WebsiteEventEnvelope::new(event_type, 1, occurred_at(), tenant(tenant_id), payload)
    }

    fn lead(tenant_id: &str, email: &str) -> WebsiteEventEnvelope {
        envelope(
            tenant_id,
            LEAD_SUBMITTED,
            json!({ "email": email, "name": "Jane", "listingId": "L-42" }),
        )
    }

    fn queue_with(handlers: HandlerRegistry) -> (Arc<InMemoryIngestionStore>, MemoryQueue) {
        let store = InMemoryIngestionStore::arc();
        let config = QueueConfig {
            processor: ProcessorConfig {
                retry_policy: RetryPolicy::exponential(
                    MAX_ATTEMPTS,
                    Duration::from_secs(30),
                    Duration::from_secs(3600),
                ),
                handler_timeout: Duration::from_secs(5),
                stale_after: None,
            },
            ..QueueConfig::default()
        };
        (store.clone(), IngestionQueue::new(store, handlers, config))
    }

    /// Run batches, jumping the clock past any backoff, until nothing is due.
    async fn drain(queue: &MemoryQueue, mut now: DateTime<Utc>) -> u32 {
        let mut rounds = 0;
        loop {
            let result = queue.process_batch_at(now, 200).await.unwrap();
            if result.picked_count == 0 {
                return rounds;
            }
            rounds += 1;
            now += chrono::Duration::hours(2);
        }
    }

    /// Records how many times each job was dispatched.
    #[derive(Default)]
    struct CountingHandler {
        calls: Mutex<HashMap<JobId, u32>>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(
            &self,
            ctx: &HandlerContext,
            _: &WebsiteEvent,
        ) -> Result<(), HandlerError> {
            *self.calls.lock().unwrap().entry(ctx.job_id).or_default() += 1;
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_tenant() {
        let (store, queue) = queue_with(HandlerRegistry::new());

        let first = queue.enqueue(&lead("acme", "jane@example.com")).await;
        let again = queue.enqueue(&lead("acme", "JANE@example.com ")).await;
        let other_tenant = queue.enqueue(&lead("globex", "jane@example.com")).await;

        assert!(first.accepted && !first.duplicate);
        assert!(again.accepted && again.duplicate);
        assert_eq!(again.job_id, first.job_id);
        assert!(other_tenant.accepted && !other_tenant.duplicate);
        assert_ne!(other_tenant.job_id, first.job_id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn client_idempotency_key_overrides_payload_identity() {
        let (store, queue) = queue_with(HandlerRegistry::new());

        let a = lead("acme", "a@example.com").with_idempotency_key("form-123");
        let b = lead("acme", "b@example.com").with_idempotency_key("form-123");

        let first = queue.enqueue(&a).await;
        let second = queue.enqueue(&b).await;
        assert!(second.duplicate);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_dead_letters_after_exactly_max_attempts() {
        let (_, queue) = queue_with(HandlerRegistry::new());
        let result = queue
            .enqueue(&envelope("acme", "chat.opened", json!({ "visitor": "v-1" })))
            .await;
        let job_id = result.job_id.unwrap();

        let rounds = drain(&queue, Utc::now()).await;
        assert_eq!(rounds, MAX_ATTEMPTS);

        let job = queue.get_job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.attempt_count, MAX_ATTEMPTS);
        assert!(job.dead_lettered_at.is_some());
        assert!(
            job.last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("unknown_event_type")),
            "{job:?}"
        );
    }

    #[tokio::test]
    async fn valid_event_without_handler_is_retried_then_dead_lettered() {
        let (_, queue) = queue_with(HandlerRegistry::new());
        let result = queue
            .enqueue(&envelope(
                "acme",
                VALUATION_REQUESTED,
                json!({ "email": "owner@example.com", "address": "1 Main St" }),
            ))
            .await;

        drain(&queue, Utc::now()).await;

        let job = queue
            .get_job_by_id(result.job_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(
            job.last_error.as_deref(),
            Some("no_handler: valuation.requested")
        );
    }

    #[tokio::test]
    async fn requeue_restores_processability() {
        let (_, queue) = queue_with(HandlerRegistry::new());
        let job_id = queue
            .enqueue(&lead("acme", "broken-address"))
            .await
            .job_id
            .unwrap();
        drain(&queue, Utc::now()).await;

        let requeued = queue.requeue_dead_letter(job_id).await.unwrap();
        assert!(requeued.requeued);

        let job = queue.get_job_by_id(job_id).await.unwrap().unwrap();
        let now = Utc::now();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_attempt_at <= now);

        // One fresh attempt, then straight back to the dead-letter queue.
        let result = queue.process_batch_at(now, 10).await.unwrap();
        assert_eq!(result.picked_count, 1);
        assert_eq!(result.dead_lettered_count, 1);
    }

    #[tokio::test]
    async fn schedule_now_pulls_a_backed_off_job_forward() {
        let (_, queue) = queue_with(HandlerRegistry::new());
        let job_id = queue
            .enqueue(&lead("acme", "nope"))
            .await
            .job_id
            .unwrap();

        let now = Utc::now();
        queue.process_batch_at(now, 10).await.unwrap();
        let job = queue.get_job_by_id(job_id).await.unwrap().unwrap();
        assert!(job.next_attempt_at > now);

        assert!(queue.schedule_now(job_id).await.unwrap());
        let result = queue.process_batch(10).await.unwrap();
        assert_eq!(result.picked_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batches_never_dispatch_twice() {
        let handler = Arc::new(CountingHandler::default());
        let handlers = HandlerRegistry::new().with(LEAD_SUBMITTED, handler.clone());
        let (_, queue) = queue_with(handlers);
        let queue = Arc::new(queue);

        for i in 0..120 {
            let result = queue
                .enqueue(&lead("acme", &format!("lead{i}@example.com")))
                .await;
            assert!(result.accepted);
        }

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut processed = 0;
                    loop {
                        let result = queue.process_batch(7).await.unwrap();
                        if result.picked_count == 0 {
                            return processed;
                        }
                        processed += result.processed_count;
                    }
                })
            })
            .collect();

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }

        assert_eq!(total, 120);
        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 120);
        assert!(calls.values().all(|&n| n == 1));
        assert_eq!(queue.stats(None).await.unwrap().processed, 120);
    }

    #[tokio::test]
    async fn dead_letter_listing_is_tenant_scoped_with_a_global_feed() {
        let (_, queue) = queue_with(HandlerRegistry::new());
        for (tenant_id, email) in [("acme", "x1"), ("acme", "x2"), ("globex", "x3")] {
            queue.enqueue(&lead(tenant_id, email)).await;
        }
        drain(&queue, Utc::now()).await;

        let acme = DeadLetterFilter::new(Some(tenant("acme")), None, None);
        let listed = queue.list_dead_letters(&acme).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.tenant_id.as_str() == "acme"));
        assert!(listed.iter().all(|e| e.payload.is_none()));

        let global = DeadLetterFilter::default().with_payload(true);
        let listed = queue.list_dead_letters(&global).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|e| e.payload.is_some()));
        assert!(
            listed
                .windows(2)
                .all(|w| w[0].dead_lettered_at >= w[1].dead_lettered_at)
        );

        let page = DeadLetterFilter::new(None, Some(2), Some(2));
        assert_eq!(queue.list_dead_letters(&page).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operator_requeues_one_job_then_the_rest_of_the_tenant() {
        let (_, queue) = queue_with(HandlerRegistry::new());

        let a = queue
            .enqueue(&lead("acme", "missing-at-sign-a"))
            .await
            .job_id
            .unwrap();
        let b = queue
            .enqueue(&lead("acme", "missing-at-sign-b"))
            .await
            .job_id
            .unwrap();

        assert!(drain(&queue, Utc::now()).await <= MAX_ATTEMPTS);

        let filter = DeadLetterFilter::new(Some(tenant("acme")), Some(50), Some(0));
        let listed = queue.list_dead_letters(&filter).await.unwrap();
        assert!(listed.len() >= 2);
        assert!(listed.iter().any(|e| e.id == a));
        assert!(listed.iter().any(|e| e.id == b));

        assert!(queue.requeue_dead_letter(a).await.unwrap().requeued);
        let job_b = queue.get_job_by_id(b).await.unwrap().unwrap();
        assert_eq!(job_b.status, JobStatus::DeadLetter);

        let batch = queue.requeue_dead_letters(&filter).await.unwrap();
        assert_eq!(
            batch,
            RequeueBatchResult {
                requeued_count: 1,
                skipped_count: 0
            }
        );

        let stats = queue.stats(Some(&tenant("acme"))).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_letter, 0);
    }

    #[tokio::test]
    async fn outage_degrades_to_structured_results() {
        let (store, queue) = queue_with(HandlerRegistry::new());
        store.set_available(false);

        let enqueued = queue.enqueue(&lead("acme", "jane@example.com")).await;
        assert!(!enqueued.accepted);
        assert_eq!(
            serde_json::to_value(&enqueued).unwrap()["reason"],
            "store_unavailable"
        );

        let report = queue.is_ready().await;
        assert!(!report.ready);
        let err = queue
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "store_unavailable");

        store.set_available(true);
        assert!(queue.enqueue(&lead("acme", "jane@example.com")).await.accepted);
    }
}

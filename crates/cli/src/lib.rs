//! Operator CLI for the ingestion queue.
//!
//! Every command prints exactly one JSON line with an `event` discriminator on
//! stdout. Infrastructure failures print a `command_failed` line on stderr and
//! exit with status 1; malformed arguments exit with status 2.

pub mod output;

use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use tracing::info;

use leadflow_core::TenantId;
use leadflow_infra::IngestionConfig;
use leadflow_infra::ingestion::{
    DEFAULT_PAGE_LIMIT, DeadLetterFilter, HandlerRegistry, IngestionQueue, IngestionStore, JobId,
    Migrator, PostgresIngestionStore,
};

pub use output::{CommandError, CommandFailed, CommandOutput};

#[derive(Debug, Parser)]
#[command(name = "leadflow")]
#[command(about = "Website event ingestion queue operator CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations
    #[command(name = "migrate")]
    Migrate,
    #[command(flatten)]
    Queue(QueueCommand),
}

/// Commands served through the ingestion queue.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List dead-lettered jobs, newest first
    #[command(name = "dead-letter:list")]
    DeadLetterList(ListArgs),
    /// Requeue one dead-lettered job, or a page of them
    #[command(name = "dead-letter:requeue")]
    DeadLetterRequeue(RequeueArgs),
    /// Show one job
    #[command(name = "jobs:get")]
    JobsGet(JobArgs),
    /// Make a pending job due now
    #[command(name = "jobs:schedule-now")]
    JobsScheduleNow(JobArgs),
    /// Job counts per status
    #[command(name = "jobs:stats")]
    JobsStats(StatsArgs),
    /// Release processing jobs abandoned by crashed workers
    #[command(name = "jobs:reclaim-stale")]
    JobsReclaimStale(ReclaimArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ListArgs {
    /// Restrict to one tenant; omit for the global feed
    #[arg(long)]
    pub tenant_id: Option<TenantId>,
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    pub limit: u32,
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
    #[arg(long)]
    pub include_payload: bool,
}

#[derive(Debug, Clone, Args)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["job_id", "tenant_id", "all_tenants"])
))]
pub struct RequeueArgs {
    #[arg(long)]
    pub job_id: Option<JobId>,
    #[arg(long)]
    pub tenant_id: Option<TenantId>,
    /// Requeue across every tenant
    #[arg(long)]
    pub all_tenants: bool,
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    pub limit: u32,
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

#[derive(Debug, Clone, Args)]
pub struct JobArgs {
    #[arg(long)]
    pub job_id: JobId,
}

#[derive(Debug, Clone, Args)]
pub struct StatsArgs {
    #[arg(long)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Clone, Args)]
pub struct ReclaimArgs {
    /// Age of the claim in seconds; defaults to INGESTION_STALE_AFTER_SECS
    #[arg(long)]
    pub older_than_secs: Option<u64>,
}

impl Command {
    /// Name as typed on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Migrate => "migrate",
            Command::Queue(q) => q.name(),
        }
    }
}

impl QueueCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QueueCommand::DeadLetterList(_) => "dead-letter:list",
            QueueCommand::DeadLetterRequeue(_) => "dead-letter:requeue",
            QueueCommand::JobsGet(_) => "jobs:get",
            QueueCommand::JobsScheduleNow(_) => "jobs:schedule-now",
            QueueCommand::JobsStats(_) => "jobs:stats",
            QueueCommand::JobsReclaimStale(_) => "jobs:reclaim-stale",
        }
    }
}

/// Run a parsed command against Postgres.
pub async fn run(
    command: Command,
    config: &IngestionConfig,
) -> Result<CommandOutput, CommandError> {
    let database_url = config.require_database_url()?;
    let store = PostgresIngestionStore::connect_lazy(
        database_url,
        config.db_max_connections,
        config.readiness_timeout,
    )?;

    match command {
        Command::Migrate => migrate(&store).await,
        Command::Queue(command) => {
            // The CLI never dispatches, so no handlers are registered.
            let queue = IngestionQueue::new(store, HandlerRegistry::new(), config.queue_config());
            execute(command, &queue, config).await
        }
    }
}

async fn migrate(store: &PostgresIngestionStore) -> Result<CommandOutput, CommandError> {
    let migrator = Migrator::new(store.pool().clone());
    let applied = migrator
        .run()
        .await
        .context("applying migrations")
        .map_err(|e| CommandError::from_anyhow("migration_failed", e))?;
    let current_version = migrator.current_version().await?;
    info!(applied, current_version, "migrations complete");
    Ok(CommandOutput::MigrateResult {
        applied,
        current_version,
    })
}

/// Run a queue command. Generic over the store so it can be exercised in memory.
pub async fn execute<S>(
    command: QueueCommand,
    queue: &IngestionQueue<S>,
    config: &IngestionConfig,
) -> Result<CommandOutput, CommandError>
where
    S: IngestionStore + Clone,
{
    match command {
        QueueCommand::DeadLetterList(args) => {
            let filter = DeadLetterFilter::new(args.tenant_id, Some(args.limit), Some(args.offset))
                .with_payload(args.include_payload);
            let jobs = queue.list_dead_letters(&filter).await?;
            Ok(CommandOutput::DeadLetterListResult {
                limit: filter.effective_limit(),
                offset: filter.offset,
                count: jobs.len(),
                include_payload: filter.include_payload,
                tenant_id: filter.tenant_id,
                jobs,
            })
        }
        QueueCommand::DeadLetterRequeue(args) => match args.job_id {
            Some(job_id) => {
                let result = queue.requeue_dead_letter(job_id).await?;
                Ok(CommandOutput::DeadLetterRequeueSingleResult {
                    job_id: result.job_id,
                    requeued: result.requeued,
                })
            }
            None => {
                // clap guarantees `--tenant-id` or `--all-tenants` here.
                let filter =
                    DeadLetterFilter::new(args.tenant_id, Some(args.limit), Some(args.offset));
                let result = queue.requeue_dead_letters(&filter).await?;
                Ok(CommandOutput::DeadLetterRequeueBatchResult {
                    limit: filter.effective_limit(),
                    offset: filter.offset,
                    tenant_id: filter.tenant_id,
                    requeued_count: result.requeued_count,
                    skipped_count: result.skipped_count,
                })
            }
        },
        QueueCommand::JobsGet(args) => {
            let job = queue.get_job_by_id(args.job_id).await?;
            Ok(CommandOutput::JobGetResult {
                job_id: args.job_id,
                found: job.is_some(),
                job,
            })
        }
        QueueCommand::JobsScheduleNow(args) => {
            let scheduled = queue.schedule_now(args.job_id).await?;
            Ok(CommandOutput::JobScheduleNowResult {
                job_id: args.job_id,
                scheduled,
            })
        }
        QueueCommand::JobsStats(args) => {
            let stats = queue.stats(args.tenant_id.as_ref()).await?;
            Ok(CommandOutput::JobStatsResult {
                tenant_id: args.tenant_id,
                total: stats.total(),
                stats,
            })
        }
        QueueCommand::JobsReclaimStale(args) => {
            let older_than = args
                .older_than_secs
                .map(Duration::from_secs)
                .or(config.stale_after)
                .ok_or_else(|| {
                    CommandError::new(
                        "config_invalid",
                        "stale reclaim is disabled; pass --older-than-secs",
                    )
                })?;
            let outcome = queue.reclaim_stale(older_than).await?;
            Ok(CommandOutput::StaleReclaimResult {
                older_than_secs: older_than.as_secs(),
                requeued: outcome.requeued,
                dead_lettered: outcome.dead_lettered,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadflow_events::WebsiteEventEnvelope;
    use leadflow_infra::ingestion::InMemoryIngestionStore;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn queue_over(
        store: Arc<InMemoryIngestionStore>,
    ) -> IngestionQueue<Arc<InMemoryIngestionStore>> {
        let config = IngestionConfig::default().queue_config();
        IngestionQueue::new(store, HandlerRegistry::new(), config)
    }

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("leadflow").chain(args.iter().copied()))
    }

    fn queue_command(args: &[&str]) -> QueueCommand {
        match parse(args).unwrap().command {
            Command::Queue(q) => q,
            other => panic!("expected queue command, got {other:?}"),
        }
    }

    async fn seeded_queue() -> (IngestionQueue<Arc<InMemoryIngestionStore>>, JobId) {
        let config = IngestionConfig::default();
        let queue = queue_over(InMemoryIngestionStore::arc());
        let envelope = WebsiteEventEnvelope::new(
            "lead.submitted",
            1,
            Utc::now(),
            TenantId::new("acme").unwrap(),
            json!({ "email": "broken" }),
        );
        let job_id = queue.enqueue(&envelope).await.job_id.unwrap();

        // Spend the whole retry budget.
        let mut now = Utc::now();
        for _ in 0..config.max_attempts {
            queue.process_batch_at(now, 10).await.unwrap();
            now += chrono::Duration::days(1);
        }
        (queue, job_id)
    }

    async fn run_json(queue: &IngestionQueue<Arc<InMemoryIngestionStore>>, args: &[&str]) -> Value {
        let output = execute(queue_command(args), queue, &IngestionConfig::default())
            .await
            .unwrap();
        serde_json::to_value(output).unwrap()
    }

    #[test]
    fn requeue_requires_exactly_one_target() {
        let err = parse(&["dead-letter:requeue"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let err = parse(&["dead-letter:requeue", "--tenant-id", "acme", "--all-tenants"])
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        assert!(parse(&["dead-letter:requeue", "--all-tenants"]).is_ok());
    }

    #[test]
    fn malformed_ids_are_parse_errors() {
        assert!(parse(&["jobs:get", "--job-id", "not-a-uuid"]).is_err());
        assert!(parse(&["dead-letter:list", "--tenant-id", " "]).is_err());
        assert!(parse(&["dead-letter:list", "--limit", "-1"]).is_err());
    }

    #[tokio::test]
    async fn list_then_requeue_single_and_batch() {
        let (queue, job_id) = seeded_queue().await;

        let listed = run_json(&queue, &["dead-letter:list", "--tenant-id", "acme"]).await;
        assert_eq!(listed["event"], "dead_letter_list_result");
        assert_eq!(listed["tenantId"], "acme");
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["limit"], 50);
        assert_eq!(listed["includePayload"], false);
        assert!(listed["jobs"][0].get("payload").is_none());

        let id = job_id.to_string();
        let single = run_json(&queue, &["dead-letter:requeue", "--job-id", &id]).await;
        assert_eq!(single["event"], "dead_letter_requeue_single_result");
        assert_eq!(single["jobId"], id.as_str());
        assert_eq!(single["requeued"], true);

        let batch = run_json(&queue, &["dead-letter:requeue", "--all-tenants"]).await;
        assert_eq!(batch["event"], "dead_letter_requeue_batch_result");
        assert_eq!(batch["tenantId"], Value::Null);
        assert_eq!(batch["requeuedCount"], 0);
        assert_eq!(batch["skippedCount"], 0);
    }

    #[tokio::test]
    async fn job_inspection_commands() {
        let (queue, job_id) = seeded_queue().await;
        let id = job_id.to_string();

        let got = run_json(&queue, &["jobs:get", "--job-id", &id]).await;
        assert_eq!(got["found"], true);
        assert_eq!(got["job"]["status"], "dead_letter");

        let scheduled = run_json(&queue, &["jobs:schedule-now", "--job-id", &id]).await;
        assert_eq!(scheduled["scheduled"], false);

        let stats = run_json(&queue, &["jobs:stats"]).await;
        assert_eq!(stats["event"], "job_stats_result");
        assert_eq!(stats["stats"]["deadLetter"], 1);
        assert_eq!(stats["total"], 1);

        let reclaimed = run_json(&queue, &["jobs:reclaim-stale", "--older-than-secs", "60"]).await;
        assert_eq!(reclaimed["event"], "stale_reclaim_result");
        assert_eq!(reclaimed["requeued"], 0);
    }

    #[tokio::test]
    async fn outage_maps_to_command_failed() {
        let store = InMemoryIngestionStore::arc();
        let queue = queue_over(store.clone());
        store.set_available(false);

        let err = execute(
            queue_command(&["jobs:stats"]),
            &queue,
            &IngestionConfig::default(),
        )
        .await
        .unwrap_err();
        let failed = serde_json::to_value(err.into_failed("jobs:stats")).unwrap();
        assert_eq!(failed["event"], "command_failed");
        assert_eq!(failed["command"], "jobs:stats");
        assert_eq!(failed["reason"], "store_unavailable");
    }
}

//! Worker process: runs one poller per built-in tool plus the maintenance
//! sweep until Ctrl-C.
//!
//! Environment:
//! - `DATABASE_URL`: Postgres record store (in-memory when unset)
//! - `REDIS_URL`: Redis Streams queue (in-memory when unset)
//! - `JOBFORGE_REDIS_PREFIX`: key prefix for the Redis queue
//! - `JOB_*`: orchestrator settings, see `OrchestratorConfig::from_env`

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use jobforge_infra::queue::{InMemoryJobQueue, JobQueue, QueueOptions, RedisStreamsJobQueue};
use jobforge_infra::store::{InMemoryJobRecordStore, JobRecordStore, PostgresJobRecordStore};
use jobforge_infra::{JobOrchestrator, OrchestratorConfig, ProcessorRegistry};
use jobforge_tools::builtin_catalog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    jobforge_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;
    let store = record_store().await?;
    let queue = job_queue(config.queue_options())?;
    let registry = ProcessorRegistry::from_entries(builtin_catalog())
        .context("failed to build processor registry")?;

    let orchestrator = JobOrchestrator::new(store, queue, registry, config);
    orchestrator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    orchestrator.stop().await;
    for (tool, stats) in orchestrator.poller_stats().await {
        tracing::info!(tool_slug = %tool, ?stats, "Final poller stats");
    }
    Ok(())
}

async fn record_store() -> anyhow::Result<Arc<dyn JobRecordStore>> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set; job records are kept in memory");
        return Ok(InMemoryJobRecordStore::arc());
    };

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresJobRecordStore::new(pool);
    store.migrate().await.context("failed to apply job schema")?;
    tracing::info!("Using Postgres job record store");
    Ok(Arc::new(store))
}

fn job_queue(options: QueueOptions) -> anyhow::Result<Arc<dyn JobQueue>> {
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        tracing::warn!("REDIS_URL not set; using in-process queue");
        return Ok(Arc::new(InMemoryJobQueue::with_options(options)));
    };

    let prefix = std::env::var("JOBFORGE_REDIS_PREFIX").ok();
    let queue = RedisStreamsJobQueue::new(redis_url, prefix, options)
        .context("failed to create Redis queue client")?;
    tracing::info!("Using Redis Streams job queue");
    Ok(Arc::new(queue))
}

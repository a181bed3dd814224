use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use quern_daemons::{DaemonRunner, PostgresQueue, QueueBackend};

mod config;
mod registry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Log filter via RUST_LOG, e.g. RUST_LOG=quern_daemons=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("quern-runner starting...");

    let config = config::RunnerEnvConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let queue = PostgresQueue::new(pool);
    queue.migrate().await.context("Failed to run migrations")?;

    let registry = registry::build();
    tracing::info!(
        actions = registry.action_count(),
        workflows = registry.workflow_count(),
        queues = ?config.runner.queues,
        "registry frozen"
    );

    let backend: Arc<dyn QueueBackend> = Arc::new(queue);
    let runner = Arc::new(DaemonRunner::new(backend, registry, config.runner));

    let mut running = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.run().await }
    });

    tokio::select! {
        result = &mut running => {
            // The run loop only returns after a drain; an error here means a
            // supervised component died unrecoverably
            result.context("runner task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            runner.shutdown();
            running.await.context("runner task panicked")??;
        }
    }

    tracing::info!("runner shutdown complete");
    Ok(())
}

//! Environment configuration for the runner binary

use std::time::Duration;

use quern_daemons::DaemonRunnerConfig;

/// Runner process configuration, collected from environment variables.
///
/// - `DATABASE_URL`: Postgres connection string (required)
/// - `QUERN_QUEUES`: comma-separated queue names; unset serves all queues
/// - `QUERN_ACTION_WORKERS` / `QUERN_THREADS_PER_WORKER`
/// - `QUERN_INSTANCE_WORKERS` / `QUERN_INSTANCES_PER_WORKER`
/// - `QUERN_WORKER_TIMEOUT_SECS`, `QUERN_SCHEDULED_REFRESH_SECS`,
///   `QUERN_RECLAIM_REFRESH_SECS`, `QUERN_PING_INTERVAL_SECS`,
///   `QUERN_SHUTDOWN_GRACE_SECS`
/// - `QUERN_TASKS_BEFORE_RECYCLE`: rolling worker restarts; unset disables
/// - `QUERN_MAX_DB_CONNECTIONS` (default 10)
#[derive(Debug, Clone)]
pub struct RunnerEnvConfig {
    pub database_url: String,
    pub max_db_connections: u32,
    pub runner: DaemonRunnerConfig,
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

impl RunnerEnvConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let mut runner = DaemonRunnerConfig::default();

        if let Ok(queues) = std::env::var("QUERN_QUEUES") {
            runner.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(workers) = env_usize("QUERN_ACTION_WORKERS") {
            runner.num_action_workers = workers.max(1);
        }
        if let Some(threads) = env_usize("QUERN_THREADS_PER_WORKER") {
            runner.threads_per_worker = threads.max(1);
        }
        if let Some(workers) = env_usize("QUERN_INSTANCE_WORKERS") {
            runner.max_instance_workers = workers.max(1);
        }
        if let Some(instances) = env_usize("QUERN_INSTANCES_PER_WORKER") {
            runner.max_instances_per_worker = instances.max(1);
        }

        if let Some(timeout) = env_secs("QUERN_WORKER_TIMEOUT_SECS") {
            runner.worker_timeout = timeout;
        }
        if let Some(interval) = env_secs("QUERN_SCHEDULED_REFRESH_SECS") {
            runner.update_scheduled_refresh = interval;
        }
        if let Some(interval) = env_secs("QUERN_RECLAIM_REFRESH_SECS") {
            runner.update_timed_out_workers_refresh = interval;
        }
        if let Some(interval) = env_secs("QUERN_PING_INTERVAL_SECS") {
            runner.ping_interval = interval;
        }
        if let Some(grace) = env_secs("QUERN_SHUTDOWN_GRACE_SECS") {
            runner.shutdown_grace = grace;
        }
        if let Some(tasks) = env_u32("QUERN_TASKS_BEFORE_RECYCLE") {
            runner.tasks_before_recycle = Some(tasks);
        }

        Ok(Self {
            database_url,
            max_db_connections: env_u32("QUERN_MAX_DB_CONNECTIONS").unwrap_or(10),
            runner,
        })
    }
}

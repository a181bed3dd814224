//! Daemon runner (orchestrator)
//!
//! The runner supervises the worker fleet and drives the control loops that
//! keep work flowing, each isolated and log-and-continue:
//!
//! 1. instance dispatch: ready instances -> claim -> instance channel
//! 2. action dispatch: ready actions -> claim -> action channel
//! 3. promote-scheduled: `scheduled` rows whose time has come -> `queued`
//! 4. reclaim: work abandoned by silent workers -> `queued`
//! 5. health check: dead or draining workers are replaced so the configured
//!    fleet size is maintained
//!
//! Rows are claimed under the runner's own worker-status row; if the runner
//! dies between claim and hand-off, its ping ages out and the reclaim loop
//! of a surviving runner re-queues the row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::{
    with_db_retries, NewWorker, QueueBackend, QueueTable, ReadyNotification, StoreError,
};
use crate::registry::Registry;
use crate::worker::{
    shared_receiver, ActionWorker, ActionWorkerConfig, InstanceTaskDefinition, InstanceWorker,
    InstanceWorkerConfig, SharedReceiver, TaskDefinition, WorkerHandle,
};

/// Errors surfaced by the runner
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Daemon runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRunnerConfig {
    /// Workflow queues this runner serves; empty means all
    pub queues: Vec<String>,

    /// Action workers kept alive
    pub num_action_workers: usize,

    /// Task threads per action worker
    pub threads_per_worker: usize,

    /// Instance workers kept alive
    pub max_instance_workers: usize,

    /// Concurrent instances per instance worker
    pub max_instances_per_worker: usize,

    /// Interval of the promote-scheduled loop
    #[serde(with = "duration_millis")]
    pub update_scheduled_refresh: Duration,

    /// Interval of the reclaim loop
    #[serde(with = "duration_millis")]
    pub update_timed_out_workers_refresh: Duration,

    /// A worker whose ping is older than this is considered lost
    #[serde(with = "duration_millis")]
    pub worker_timeout: Duration,

    /// Interval of the health-check loop
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Liveness ping interval for the runner and its workers
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,

    /// Fallback poll interval for suspended `run_action` calls
    #[serde(with = "duration_millis")]
    pub result_poll_interval: Duration,

    /// Recycle action workers after this many tasks; None disables it
    pub tasks_before_recycle: Option<u32>,

    /// How long shutdown waits for workers to drain before aborting them
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,
}

impl Default for DaemonRunnerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        Self {
            queues: vec![],
            num_action_workers: cpus,
            threads_per_worker: 1,
            max_instance_workers: 1,
            max_instances_per_worker: 1000,
            update_scheduled_refresh: Duration::from_secs(30),
            update_timed_out_workers_refresh: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            result_poll_interval: Duration::from_secs(1),
            tasks_before_recycle: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl DaemonRunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_action_workers(mut self, workers: usize, threads_per_worker: usize) -> Self {
        self.num_action_workers = workers.max(1);
        self.threads_per_worker = threads_per_worker.max(1);
        self
    }

    pub fn with_instance_workers(mut self, workers: usize, instances_per_worker: usize) -> Self {
        self.max_instance_workers = workers.max(1);
        self.max_instances_per_worker = instances_per_worker.max(1);
        self
    }

    pub fn with_update_scheduled_refresh(mut self, interval: Duration) -> Self {
        self.update_scheduled_refresh = interval;
        self
    }

    pub fn with_update_timed_out_workers_refresh(mut self, interval: Duration) -> Self {
        self.update_timed_out_workers_refresh = interval;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }

    pub fn with_tasks_before_recycle(mut self, tasks: u32) -> Self {
        self.tasks_before_recycle = Some(tasks);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn action_channel_capacity(&self) -> usize {
        (self.num_action_workers * self.threads_per_worker).max(1)
    }

    fn instance_channel_capacity(&self) -> usize {
        (self.max_instance_workers * self.max_instances_per_worker).max(1)
    }

    fn action_worker_config(&self) -> ActionWorkerConfig {
        let mut config = ActionWorkerConfig::new(self.threads_per_worker)
            .with_ping_interval(self.ping_interval);
        if let Some(tasks) = self.tasks_before_recycle {
            config = config.with_tasks_before_recycle(tasks);
        }
        config
    }

    fn instance_worker_config(&self) -> InstanceWorkerConfig {
        InstanceWorkerConfig::new(self.max_instances_per_worker)
            .with_ping_interval(self.ping_interval)
            .with_result_poll_interval(self.result_poll_interval)
    }
}

type WorkerMap = Arc<Mutex<HashMap<Uuid, WorkerHandle>>>;

/// The orchestrator process
///
/// # Example
///
/// ```ignore
/// let runner = Arc::new(DaemonRunner::new(backend, registry, config));
/// let running = tokio::spawn({
///     let runner = Arc::clone(&runner);
///     async move { runner.run().await }
/// });
/// // ... later
/// runner.shutdown();
/// running.await??;
/// ```
pub struct DaemonRunner {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    config: DaemonRunnerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    action_workers: WorkerMap,
    instance_workers: WorkerMap,
}

impl DaemonRunner {
    /// Create a new runner
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
        config: DaemonRunnerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            registry,
            config,
            shutdown_tx,
            shutdown_rx,
            action_workers: Arc::new(Mutex::new(HashMap::new())),
            instance_workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Signal the runner to drain and exit
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Alive (action, instance) worker counts
    pub fn worker_counts(&self) -> (usize, usize) {
        let actions = self.action_workers.lock().values().filter(|h| h.is_alive()).count();
        let instances = self
            .instance_workers
            .lock()
            .values()
            .filter(|h| h.is_alive())
            .count();
        (actions, instances)
    }

    /// Run until a shutdown signal, then drain
    pub async fn run(&self) -> Result<(), RunnerError> {
        let runner_worker_id = with_db_retries("register runner", || {
            self.backend.register_worker(NewWorker {
                internal_process_id: Uuid::new_v4(),
                is_action_worker: false,
            })
        })
        .await?;

        info!(
            runner_worker_id,
            action_workers = self.config.num_action_workers,
            instance_workers = self.config.max_instance_workers,
            queues = ?self.config.queues,
            "daemon runner starting"
        );

        let (action_tx, action_rx) = mpsc::channel(self.config.action_channel_capacity());
        let (instance_tx, instance_rx) = mpsc::channel(self.config.instance_channel_capacity());
        let action_rx = shared_receiver(action_rx);
        let instance_rx = shared_receiver(instance_rx);

        // Initial fleet
        for _ in 0..self.config.num_action_workers {
            let handle = self.spawn_action_worker(&action_rx);
            self.action_workers.lock().insert(handle.process_id(), handle);
        }
        for _ in 0..self.config.max_instance_workers {
            let handle = self.spawn_instance_worker(&instance_rx);
            self.instance_workers.lock().insert(handle.process_id(), handle);
        }

        // Control loops
        let mut loops: Vec<JoinHandle<()>> = Vec::new();

        loops.push(tokio::spawn(runner_ping_loop(
            Arc::clone(&self.backend),
            runner_worker_id,
            self.config.ping_interval,
            self.shutdown_rx.clone(),
        )));

        loops.push(tokio::spawn(instance_dispatch_loop(
            Arc::clone(&self.backend),
            self.config.queues.clone(),
            instance_tx,
            runner_worker_id,
            self.shutdown_rx.clone(),
        )));

        loops.push(tokio::spawn(action_dispatch_loop(
            Arc::clone(&self.backend),
            self.config.queues.clone(),
            action_tx,
            runner_worker_id,
            self.shutdown_rx.clone(),
        )));

        loops.push(tokio::spawn(promote_scheduled_loop(
            Arc::clone(&self.backend),
            self.config.update_scheduled_refresh,
            self.shutdown_rx.clone(),
        )));

        loops.push(tokio::spawn(reclaim_loop(
            Arc::clone(&self.backend),
            self.config.update_timed_out_workers_refresh,
            self.config.worker_timeout,
            self.shutdown_rx.clone(),
        )));

        {
            let backend = Arc::clone(&self.backend);
            let registry = Arc::clone(&self.registry);
            let config = self.config.clone();
            let action_workers = Arc::clone(&self.action_workers);
            let instance_workers = Arc::clone(&self.instance_workers);
            let action_rx = Arc::clone(&action_rx);
            let instance_rx = Arc::clone(&instance_rx);
            let mut shutdown_rx = self.shutdown_rx.clone();

            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.health_check_interval);
                let mut known_leaked = crate::worker::leaked_task_threads();
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            reap_and_replenish(
                                "action",
                                &action_workers,
                                config.num_action_workers,
                                || ActionWorker::spawn(
                                    Arc::clone(&backend),
                                    Arc::clone(&registry),
                                    Arc::clone(&action_rx),
                                    config.action_worker_config(),
                                ),
                            );
                            reap_and_replenish(
                                "instance",
                                &instance_workers,
                                config.max_instance_workers,
                                || InstanceWorker::spawn(
                                    Arc::clone(&backend),
                                    Arc::clone(&registry),
                                    Arc::clone(&instance_rx),
                                    config.instance_worker_config(),
                                ),
                            );

                            // Threads left behind by hard timeouts stay
                            // pinned to a core until this process exits
                            let leaked = crate::worker::leaked_task_threads();
                            if leaked > known_leaked {
                                warn!(
                                    leaked,
                                    "task threads leaked by hard timeouts; only a process restart reclaims them"
                                );
                                known_leaked = leaked;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            debug!("health loop: shutdown requested");
                            break;
                        }
                    }
                }
            }));
        }

        // Block until shutdown is requested
        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("daemon runner shutting down");

        // Stop the control loops first so no replacement workers appear and
        // the task channels close, which lets idle workers drain naturally
        let loops_stopped = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(loops.iter_mut()),
        )
        .await
        .is_ok();
        if !loops_stopped {
            warn!("control loops did not stop in time, aborting them");
            for handle in &loops {
                handle.abort();
            }
        }

        // Signal every worker to drain, then wait out the grace period
        {
            let action_workers = self.action_workers.lock();
            let instance_workers = self.instance_workers.lock();
            for handle in action_workers.values().chain(instance_workers.values()) {
                handle.request_shutdown();
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let alive = {
                let action_workers = self.action_workers.lock();
                let instance_workers = self.instance_workers.lock();
                action_workers
                    .values()
                    .chain(instance_workers.values())
                    .filter(|h| h.is_alive())
                    .count()
            };
            if alive == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(alive, "shutdown grace expired, aborting remaining workers");
                let action_workers = self.action_workers.lock();
                let instance_workers = self.instance_workers.lock();
                for handle in action_workers.values().chain(instance_workers.values()) {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Err(e) = self.backend.worker_ping(runner_worker_id, true).await {
            warn!("final runner ping failed: {}", e);
        }

        info!("daemon runner stopped");
        Ok(())
    }

    fn spawn_action_worker(&self, tasks: &SharedReceiver<TaskDefinition>) -> WorkerHandle {
        ActionWorker::spawn(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(tasks),
            self.config.action_worker_config(),
        )
    }

    fn spawn_instance_worker(
        &self,
        instances: &SharedReceiver<InstanceTaskDefinition>,
    ) -> WorkerHandle {
        InstanceWorker::spawn(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(instances),
            self.config.instance_worker_config(),
        )
    }
}

/// Reap dead workers and spawn replacements until `target` units are alive
/// and accepting work. A draining worker stays in the map until it exits but
/// no longer counts, which is what triggers its proactive replacement.
fn reap_and_replenish(
    kind: &str,
    workers: &Mutex<HashMap<Uuid, WorkerHandle>>,
    target: usize,
    spawn: impl Fn() -> WorkerHandle,
) {
    let mut map = workers.lock();

    let before = map.len();
    map.retain(|_, handle| handle.is_alive());
    let reaped = before - map.len();
    if reaped > 0 {
        debug!(kind, reaped, "reaped exited workers");
    }

    let active = map.values().filter(|handle| !handle.is_draining()).count();
    for _ in active..target {
        let handle = spawn();
        info!(kind, process_id = %handle.process_id(), "spawned worker");
        map.insert(handle.process_id(), handle);
    }
}

async fn runner_ping_loop(
    backend: Arc<dyn QueueBackend>,
    runner_worker_id: i64,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = backend.worker_ping(runner_worker_id, false).await {
                    error!("runner ping failed: {}", e);
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn instance_dispatch_loop(
    backend: Arc<dyn QueueBackend>,
    queues: Vec<String>,
    tx: mpsc::Sender<InstanceTaskDefinition>,
    runner_worker_id: i64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'outer: while !*shutdown_rx.borrow() {
        let mut stream = match backend.subscribe_ready(QueueTable::Instance, &queues).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot subscribe to ready instances: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            // Hold channel capacity before claiming so no ready row is ever
            // claimed without an execution slot behind it
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break 'outer,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'outer,
                },
            };

            let notification = tokio::select! {
                _ = shutdown_rx.changed() => break 'outer,
                notification = stream.recv() => match notification {
                    Some(notification) => notification,
                    None => {
                        warn!("instance ready stream ended, resubscribing");
                        break;
                    }
                },
            };

            if let Err(e) =
                dispatch_instance(&backend, runner_worker_id, notification, permit).await
            {
                error!("instance dispatch error: {}", e);
            }
        }
    }

    debug!("instance dispatch loop exited");
}

async fn dispatch_instance(
    backend: &Arc<dyn QueueBackend>,
    runner_worker_id: i64,
    notification: ReadyNotification,
    permit: mpsc::Permit<'_, InstanceTaskDefinition>,
) -> Result<(), StoreError> {
    let claimed = with_db_retries("claim instance", || {
        backend.claim_exclusive(QueueTable::Instance, notification.id, runner_worker_id)
    })
    .await?;
    if !claimed {
        debug!(id = %notification.id, "instance already claimed elsewhere");
        return Ok(());
    }

    let row = backend.fetch_instance(notification.id).await?;
    permit.send(InstanceTaskDefinition {
        instance_id: row.id,
        registry_id: row.registry_id,
        queue_name: row.workflow_name,
        raw_input: row.input_body,
    });
    Ok(())
}

async fn action_dispatch_loop(
    backend: Arc<dyn QueueBackend>,
    queues: Vec<String>,
    tx: mpsc::Sender<TaskDefinition>,
    runner_worker_id: i64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'outer: while !*shutdown_rx.borrow() {
        let mut stream = match backend.subscribe_ready(QueueTable::Action, &queues).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot subscribe to ready actions: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break 'outer,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'outer,
                },
            };

            let notification = tokio::select! {
                _ = shutdown_rx.changed() => break 'outer,
                notification = stream.recv() => match notification {
                    Some(notification) => notification,
                    None => {
                        warn!("action ready stream ended, resubscribing");
                        break;
                    }
                },
            };

            if let Err(e) = dispatch_action(&backend, runner_worker_id, notification, permit).await
            {
                error!("action dispatch error: {}", e);
            }
        }
    }

    debug!("action dispatch loop exited");
}

async fn dispatch_action(
    backend: &Arc<dyn QueueBackend>,
    runner_worker_id: i64,
    notification: ReadyNotification,
    permit: mpsc::Permit<'_, TaskDefinition>,
) -> Result<(), StoreError> {
    let claimed = with_db_retries("claim action", || {
        backend.claim_exclusive(QueueTable::Action, notification.id, runner_worker_id)
    })
    .await?;
    if !claimed {
        debug!(id = %notification.id, "action already claimed elsewhere");
        return Ok(());
    }

    let row = backend.fetch_action(notification.id).await?;
    let timeouts = row.timeouts();
    permit.send(TaskDefinition {
        action_id: row.id,
        registry_id: row.registry_id,
        input_body: row.input_body,
        timeouts,
    });
    Ok(())
}

async fn promote_scheduled_loop(
    backend: Arc<dyn QueueBackend>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for table in [QueueTable::Action, QueueTable::Instance] {
                    match backend.promote_scheduled(table).await {
                        Ok(promoted) if promoted > 0 => {
                            debug!(?table, promoted, "promoted scheduled rows");
                        }
                        Ok(_) => {}
                        Err(e) => error!(?table, "promote-scheduled failed: {}", e),
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn reclaim_loop(
    backend: Arc<dyn QueueBackend>,
    interval: Duration,
    worker_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match backend.reclaim_timed_out_workers(worker_timeout).await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            workers = report.workers_cleaned,
                            actions = report.actions_requeued,
                            instances = report.instances_requeued,
                            "reclaimed work from timed-out workers"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("reclaim failed: {}", e),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonRunnerConfig::default();
        assert!(config.num_action_workers >= 1);
        assert_eq!(config.threads_per_worker, 1);
        assert_eq!(config.max_instance_workers, 1);
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.worker_timeout, Duration::from_secs(300));
        assert!(config.queues.is_empty());
    }

    #[test]
    fn test_channel_capacities() {
        let config = DaemonRunnerConfig::new()
            .with_action_workers(4, 2)
            .with_instance_workers(2, 100);

        assert_eq!(config.action_channel_capacity(), 8);
        assert_eq!(config.instance_channel_capacity(), 200);
    }

    #[test]
    fn test_config_builder() {
        let config = DaemonRunnerConfig::new()
            .with_queues(vec!["orders".into()])
            .with_action_workers(2, 3)
            .with_worker_timeout(Duration::from_secs(60))
            .with_tasks_before_recycle(50);

        assert_eq!(config.queues, vec!["orders".to_string()]);
        assert_eq!(config.num_action_workers, 2);
        assert_eq!(config.threads_per_worker, 3);
        assert_eq!(config.worker_timeout, Duration::from_secs(60));
        assert_eq!(config.tasks_before_recycle, Some(50));

        let worker_config = config.action_worker_config();
        assert_eq!(worker_config.pool_size, 3);
        assert_eq!(worker_config.tasks_before_recycle, Some(50));
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonRunnerConfig::new().with_action_workers(2, 2);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DaemonRunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.num_action_workers, 2);
        assert_eq!(parsed.worker_timeout, config.worker_timeout);
    }
}

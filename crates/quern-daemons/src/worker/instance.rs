//! Instance worker
//!
//! Drives many workflow instances concurrently on one cooperative
//! scheduler. Each instance executes its workflow's `run` through the
//! registry; every `run_action` call suspends the instance until the
//! results listener observes the matching result row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{SharedReceiver, WorkerError, WorkerHandle};
use crate::queue::{with_db_retries, NewWorker, QueueBackend};
use crate::registry::Registry;
use crate::workflow::WorkflowContext;

/// How long a pull waits before re-checking the draining flag
const PULL_TIMEOUT: Duration = Duration::from_secs(1);

/// One workflow instance handed to a worker over the instance channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTaskDefinition {
    pub instance_id: Uuid,
    pub registry_id: String,
    pub queue_name: String,
    pub raw_input: Value,
}

/// Instance worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceWorkerConfig {
    /// Maximum concurrently driven instances
    pub max_instances: usize,

    /// Liveness ping interval
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,

    /// Fallback interval at which a suspended `run_action` re-checks its
    /// row, covering lost notifications
    #[serde(with = "duration_millis")]
    pub result_poll_interval: Duration,
}

impl Default for InstanceWorkerConfig {
    fn default() -> Self {
        Self {
            max_instances: 1000,
            ping_interval: Duration::from_secs(30),
            result_poll_interval: Duration::from_secs(1),
        }
    }
}

impl InstanceWorkerConfig {
    pub fn new(max_instances: usize) -> Self {
        Self {
            max_instances: max_instances.max(1),
            ..Default::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }
}

/// Instance worker unit
pub struct InstanceWorker {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    config: InstanceWorkerConfig,
    process_id: Uuid,
    draining: Arc<AtomicBool>,
    drain_tx: watch::Sender<bool>,
    waiters: Arc<DashMap<Uuid, Arc<Notify>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InstanceWorker {
    /// Spawn a worker pulling from the shared instance channel
    pub fn spawn(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
        instances: SharedReceiver<InstanceTaskDefinition>,
        config: InstanceWorkerConfig,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        let process_id = Uuid::new_v4();

        let worker = InstanceWorker {
            backend,
            registry,
            config,
            process_id,
            draining: Arc::new(AtomicBool::new(false)),
            drain_tx,
            waiters: Arc::new(DashMap::new()),
            shutdown_rx,
        };

        let join = tokio::spawn(async move {
            if let Err(e) = worker.run(instances).await {
                error!(%process_id, "instance worker failed: {}", e);
            }
        });

        WorkerHandle::new(process_id, join, shutdown_tx, drain_rx)
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    fn flag_draining(&self) {
        if !self.draining.swap(true, Ordering::Relaxed) {
            info!(process_id = %self.process_id, "instance worker draining");
            let _ = self.drain_tx.send(true);
        }
    }

    async fn run(
        self,
        instances: SharedReceiver<InstanceTaskDefinition>,
    ) -> Result<(), WorkerError> {
        let worker_status_id = with_db_retries("register instance worker", || {
            self.backend.register_worker(NewWorker {
                internal_process_id: self.process_id,
                is_action_worker: false,
            })
        })
        .await?;

        info!(
            process_id = %self.process_id,
            worker_status_id,
            max_instances = self.config.max_instances,
            "instance worker started"
        );

        let ping = tokio::spawn(ping_loop(
            Arc::clone(&self.backend),
            worker_status_id,
            Arc::clone(&self.draining),
            self.config.ping_interval,
        ));

        let listener = tokio::spawn(results_listener(
            Arc::clone(&self.backend),
            Arc::clone(&self.waiters),
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_instances));
        let mut shutdown_rx = self.shutdown_rx.clone();

        while !self.is_draining() {
            if *shutdown_rx.borrow_and_update() {
                self.flag_draining();
                break;
            }

            let permit = match tokio::time::timeout(
                PULL_TIMEOUT,
                Arc::clone(&semaphore).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => continue,
            };

            let task = {
                let mut rx = instances.lock().await;
                match tokio::time::timeout(PULL_TIMEOUT, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        drop(permit);
                        self.flag_draining();
                        break;
                    }
                    Err(_) => {
                        drop(permit);
                        continue;
                    }
                }
            };

            debug!(instance_id = %task.instance_id, "received instance");

            if let Err(e) = with_db_retries("assign instance", || {
                self.backend
                    .assign_instance(task.instance_id, worker_status_id)
            })
            .await
            {
                warn!(instance_id = %task.instance_id, "failed to record assignment: {}", e);
            }

            let backend = Arc::clone(&self.backend);
            let registry = Arc::clone(&self.registry);
            let waiters = Arc::clone(&self.waiters);
            let poll_interval = self.config.result_poll_interval;

            tokio::spawn(async move {
                let _permit = permit;
                drive_instance(backend, registry, waiters, poll_interval, task).await;
            });
        }

        // Drain: wait for in-flight instances to finish
        let _ = semaphore.acquire_many(self.config.max_instances as u32).await;

        listener.abort();
        ping.abort();
        if let Err(e) = self.backend.worker_ping(worker_status_id, true).await {
            warn!("final ping failed: {}", e);
        }

        info!(process_id = %self.process_id, "instance worker exited");
        Ok(())
    }
}

/// Run one workflow instance to its terminal state
async fn drive_instance(
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    waiters: Arc<DashMap<Uuid, Arc<Notify>>>,
    poll_interval: Duration,
    task: InstanceTaskDefinition,
) {
    let driver = match registry.workflow(&task.registry_id) {
        Ok(driver) => driver,
        Err(e) => {
            error!(instance_id = %task.instance_id, "cannot drive instance: {}", e);
            record_failure(&backend, task.instance_id, &e.to_string()).await;
            return;
        }
    };

    let ctx = WorkflowContext::new(
        task.instance_id,
        task.queue_name.clone(),
        Arc::clone(&backend),
        registry,
        waiters,
        poll_interval,
    );

    match driver(ctx, task.raw_input).await {
        Ok(output) => {
            debug!(instance_id = %task.instance_id, "workflow completed");
            if let Err(e) = with_db_retries("complete instance", || {
                backend.complete_instance(task.instance_id, output.clone())
            })
            .await
            {
                error!(instance_id = %task.instance_id, "failed to record output: {}", e);
            }
        }
        Err(workflow_error) => {
            // Terminal by design: replaying on another worker would hit the
            // same bug
            warn!(instance_id = %task.instance_id, "workflow failed: {}", workflow_error);
            record_failure(&backend, task.instance_id, &workflow_error.message).await;
        }
    }
}

async fn record_failure(backend: &Arc<dyn QueueBackend>, instance_id: Uuid, error: &str) {
    if let Err(e) = with_db_retries("fail instance", || {
        backend.fail_instance(instance_id, error)
    })
    .await
    {
        error!(%instance_id, "failed to record workflow error: {}", e);
    }
}

/// Resolve suspended `run_action` calls as result rows land
async fn results_listener(
    backend: Arc<dyn QueueBackend>,
    waiters: Arc<DashMap<Uuid, Arc<Notify>>>,
) {
    loop {
        let mut stream = match backend.subscribe_results().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot subscribe to results: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(notification) = stream.recv().await {
            if let Some(waiter) = waiters.get(&notification.action_id) {
                waiter.notify_waiters();
            }
        }

        warn!("result stream ended, resubscribing");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Keep the worker's liveness row fresh
async fn ping_loop(
    backend: Arc<dyn QueueBackend>,
    worker_status_id: i64,
    draining: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let is_draining = draining.load(Ordering::Relaxed);
        if let Err(e) = backend.worker_ping(worker_status_id, is_draining).await {
            error!(worker_status_id, "ping failed: {}", e);
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

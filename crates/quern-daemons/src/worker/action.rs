//! Action worker
//!
//! Executes actions pulled from the runner's task channel on a pool of OS
//! threads, each running its own single-threaded scheduler. A watcher
//! enforces the per-task deadlines:
//!
//! - a crossed soft deadline cancels the task cooperatively at its next
//!   suspension point and reports `"Task soft-timed out."`
//! - a crossed hard deadline flags the whole worker as draining, since a
//!   thread saturating the CPU cannot be interrupted from inside the
//!   process; the worker stops pulling work, lets well-behaved threads
//!   finish, reports `"Task hard-timed out."` for the stuck ones, reaps
//!   every thread that did finish, and counts the survivors on the
//!   process-wide [`leaked_task_threads`] gauge before exiting so the
//!   runner can replace it

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cputime::ThreadCpuClock;
use super::{SharedReceiver, WorkerError, WorkerHandle};
use crate::queue::{with_db_retries, ActionOutcome, NewWorker, QueueBackend, StoreError};
use crate::registry::Registry;
use crate::reliability::{first_exceeded, min_soft_limit, TimeoutDefinition, TimeoutKind};

/// Marker stored in the result row when a soft deadline cancelled the task
pub const SOFT_TIMEOUT_MARKER: &str = "Task soft-timed out.";

/// Marker stored in the result row when a hard deadline drained the worker
pub const HARD_TIMEOUT_MARKER: &str = "Task hard-timed out.";

/// How often the soft-timeout sentinel re-checks the watcher's flags
const SOFT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a pull waits before re-checking the draining flag
const PULL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the drain epilogue waits for cooperatively cancelled threads to
/// finish before taking stock of the stuck ones
const DRAIN_REAP_GRACE: Duration = Duration::from_secs(5);

/// Task threads stuck past a hard deadline that outlived their worker.
///
/// An OS thread saturated by non-yielding user code cannot be terminated
/// from inside the process, so a drained worker leaves it behind. The gauge
/// keeps those threads visible to supervision instead of letting them
/// vanish when the worker unit is reaped; each one occupies a core until
/// the orchestrator process itself exits.
static LEAKED_TASK_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Number of task threads leaked by hard timeouts since process start
pub fn leaked_task_threads() -> usize {
    LEAKED_TASK_THREADS.load(Ordering::Relaxed)
}

/// One action handed to a worker over the task channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Row id, used to report results and to cancel on timeout
    pub action_id: Uuid,

    pub registry_id: String,
    pub input_body: Option<Value>,
    pub timeouts: Vec<TimeoutDefinition>,
}

/// Action worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionWorkerConfig {
    /// Number of concurrent task threads
    pub pool_size: usize,

    /// Liveness ping interval
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,

    /// Deadline check interval
    #[serde(with = "duration_millis")]
    pub watch_interval: Duration,

    /// Drain after this many tasks (rolling restart); None disables it
    pub tasks_before_recycle: Option<u32>,
}

impl Default for ActionWorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            ping_interval: Duration::from_secs(30),
            watch_interval: Duration::from_secs(1),
            tasks_before_recycle: None,
        }
    }
}

impl ActionWorkerConfig {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            ..Default::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn with_tasks_before_recycle(mut self, tasks: u32) -> Self {
        self.tasks_before_recycle = Some(tasks);
        self
    }
}

/// Live bookkeeping for one executing task thread
struct ThreadState {
    thread_id: Uuid,
    task: TaskDefinition,
    started_wall: Instant,
    cpu_clock: OnceLock<ThreadCpuClock>,
    timed_out: parking_lot::Mutex<HashSet<TimeoutKind>>,
    join: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadState {
    fn new(task: TaskDefinition) -> Self {
        Self {
            thread_id: Uuid::new_v4(),
            task,
            started_wall: Instant::now(),
            cpu_clock: OnceLock::new(),
            timed_out: parking_lot::Mutex::new(HashSet::new()),
            join: parking_lot::Mutex::new(None),
        }
    }

    /// Record a crossed deadline; true if it was newly recorded
    fn flag(&self, kind: TimeoutKind) -> bool {
        self.timed_out.lock().insert(kind)
    }

    fn is_flagged(&self, kind: TimeoutKind) -> bool {
        self.timed_out.lock().contains(&kind)
    }

    fn any_flagged(&self) -> bool {
        !self.timed_out.lock().is_empty()
    }
}

/// Action worker unit
///
/// Spawned and supervised by the daemon runner; several workers share one
/// bounded task channel.
pub struct ActionWorker {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    config: ActionWorkerConfig,
    process_id: Uuid,
    draining: Arc<AtomicBool>,
    drain_tx: watch::Sender<bool>,
    threads: Arc<DashMap<Uuid, Arc<ThreadState>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ActionWorker {
    /// Spawn a worker pulling from the shared task channel
    pub fn spawn(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
        tasks: SharedReceiver<TaskDefinition>,
        config: ActionWorkerConfig,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        let process_id = Uuid::new_v4();

        let worker = ActionWorker {
            backend,
            registry,
            config,
            process_id,
            draining: Arc::new(AtomicBool::new(false)),
            drain_tx,
            threads: Arc::new(DashMap::new()),
            shutdown_rx,
        };

        let join = tokio::spawn(async move {
            if let Err(e) = worker.run(tasks).await {
                error!(%process_id, "action worker failed: {}", e);
            }
        });

        WorkerHandle::new(process_id, join, shutdown_tx, drain_rx)
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Stop pulling new tasks; in-flight threads run to completion or to
    /// their hard deadline. The runner observes the event and spawns a
    /// replacement.
    fn flag_draining(&self) {
        if !self.draining.swap(true, Ordering::Relaxed) {
            info!(process_id = %self.process_id, "action worker draining");
            let _ = self.drain_tx.send(true);
        }
    }

    async fn run(self, tasks: SharedReceiver<TaskDefinition>) -> Result<(), WorkerError> {
        let worker_status_id = with_db_retries("register action worker", || {
            self.backend.register_worker(NewWorker {
                internal_process_id: self.process_id,
                is_action_worker: true,
            })
        })
        .await?;

        info!(
            process_id = %self.process_id,
            worker_status_id,
            pool_size = self.config.pool_size,
            "action worker started"
        );

        let ping = tokio::spawn(ping_loop(
            Arc::clone(&self.backend),
            worker_status_id,
            Arc::clone(&self.draining),
            self.config.ping_interval,
        ));

        // The watcher enforces deadlines for the whole life of the worker
        // and doubles as the drain barrier: it returns once the worker is
        // draining and only deadline-flagged threads remain.
        let watcher = tokio::spawn(watch_loop(
            Arc::clone(&self.threads),
            Arc::clone(&self.draining),
            self.drain_tx.clone(),
            self.config.watch_interval,
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.pool_size));
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut handled: u32 = 0;

        // Pull loop: hold a pool slot before dequeuing to keep FIFO order
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
                // All slots busy: re-check the draining flag and wait again
                Err(_) => continue,
            };

            let task = {
                let mut rx = tasks.lock().await;
                match tokio::time::timeout(PULL_TIMEOUT, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        // Channel closed: the runner is gone, drain out
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

            debug!(action_id = %task.action_id, "received task");

            if let Err(e) = with_db_retries("assign action", || {
                self.backend.assign_action(task.action_id, worker_status_id)
            })
            .await
            {
                warn!(action_id = %task.action_id, "failed to record assignment: {}", e);
            }

            self.execute_task(task, permit);

            handled += 1;
            if let Some(max) = self.config.tasks_before_recycle {
                if handled >= max {
                    debug!(handled, "task recycle threshold reached");
                    self.flag_draining();
                }
            }
        }

        // Wait until only hard-timed-out threads remain
        let _ = watcher.await;

        // Whatever is still registered is stuck past a hard deadline; mark
        // those rows failed so the retry policy or reclaim loop can requeue
        let stuck: Vec<Arc<ThreadState>> = self
            .threads
            .iter()
            .filter(|entry| entry.value().is_flagged(TimeoutKind::Hard))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for state in stuck {
            report_failure(
                &self.backend,
                state.task.action_id,
                HARD_TIMEOUT_MARKER.to_string(),
                None,
            )
            .await;
        }

        // Cooperatively cancelled threads finish within a few scheduler
        // turns; give them a moment before taking stock
        let reap_deadline = tokio::time::Instant::now() + DRAIN_REAP_GRACE;
        while tokio::time::Instant::now() < reap_deadline {
            let finishing = self
                .threads
                .iter()
                .any(|entry| !entry.value().is_flagged(TimeoutKind::Hard));
            if !finishing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Reap every thread that finished. A thread still running here is
        // saturated by non-yielding user code and cannot be terminated from
        // inside the process: count it on the gauge so it stays visible to
        // supervision instead of silently outliving its worker.
        let remaining: Vec<Arc<ThreadState>> = self
            .threads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for state in remaining {
            let handle = state.join.lock().take();
            match handle {
                Some(handle) if handle.is_finished() => {
                    let _ = handle.join();
                    self.threads.remove(&state.thread_id);
                }
                Some(handle) => {
                    LEAKED_TASK_THREADS.fetch_add(1, Ordering::Relaxed);
                    error!(
                        thread_id = %state.thread_id,
                        action_id = %state.task.action_id,
                        leaked_total = leaked_task_threads(),
                        "task thread is stuck in non-yielding code and outlives its worker"
                    );
                    drop(handle);
                }
                None => {}
            }
        }

        // Final ping, then exit; the runner reaps this unit
        ping.abort();
        if let Err(e) = self.backend.worker_ping(worker_status_id, true).await {
            warn!("final ping failed: {}", e);
        }

        info!(process_id = %self.process_id, "action worker exited");
        Ok(())
    }

    /// Run one task on a fresh OS thread with its own scheduler
    fn execute_task(&self, task: TaskDefinition, permit: tokio::sync::OwnedSemaphorePermit) {
        let state = Arc::new(ThreadState::new(task));
        self.threads.insert(state.thread_id, Arc::clone(&state));

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let threads = Arc::clone(&self.threads);
        let thread_state = Arc::clone(&state);

        let spawned = std::thread::Builder::new()
            .name(format!("quern-action-{}", state.thread_id))
            .spawn(move || {
                // The permit rides with the thread: a stuck thread keeps its
                // pool slot occupied, which is what forces the drain
                let _permit = permit;

                if let Some(clock) = ThreadCpuClock::for_current_thread() {
                    let _ = thread_state.cpu_clock.set(clock);
                }

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to build task runtime: {}", e);
                        threads.remove(&thread_state.thread_id);
                        return;
                    }
                };

                runtime.block_on(run_one_task(backend, registry, Arc::clone(&thread_state)));
                threads.remove(&thread_state.thread_id);
            });

        match spawned {
            Ok(handle) => {
                // Own the handle so the drain epilogue can reap the thread
                // or account for it if it never finishes
                *state.join.lock() = Some(handle);
            }
            Err(e) => {
                error!("failed to spawn task thread: {}", e);
                self.threads.remove(&state.thread_id);
            }
        }
    }
}

/// Deadline watcher; also the drain barrier.
///
/// Runs until the worker is draining and no thread is left that could
/// still finish cleanly.
async fn watch_loop(
    threads: Arc<DashMap<Uuid, Arc<ThreadState>>>,
    draining: Arc<AtomicBool>,
    drain_tx: watch::Sender<bool>,
    watch_interval: Duration,
) {
    let mut initialized = false;
    loop {
        if initialized {
            tokio::time::sleep(watch_interval).await;
        }
        initialized = true;

        let mut valid_threads = 0;
        for entry in threads.iter() {
            let state = entry.value();
            let wall_elapsed = state.started_wall.elapsed();
            let cpu_elapsed = state.cpu_clock.get().and_then(|clock| clock.elapsed());

            if let Some(kind) = first_exceeded(&state.task.timeouts, wall_elapsed, cpu_elapsed) {
                if state.flag(kind) {
                    warn!(
                        thread_id = %state.thread_id,
                        action_id = %state.task.action_id,
                        ?kind,
                        ?wall_elapsed,
                        ?cpu_elapsed,
                        "task exceeded its deadline"
                    );
                    if kind == TimeoutKind::Hard && !draining.swap(true, Ordering::Relaxed) {
                        info!("hard timeout, worker draining");
                        let _ = drain_tx.send(true);
                    }
                }
            }

            if !state.any_flagged() {
                valid_threads += 1;
            }
        }

        if draining.load(Ordering::Relaxed) && valid_threads == 0 {
            break;
        }
    }
}

/// Execute the action future, racing it against the soft-timeout sentinel
async fn run_one_task(
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    state: Arc<ThreadState>,
) {
    let task = &state.task;

    let handler = match registry.action(&task.registry_id) {
        Ok(handler) => handler,
        Err(e) => {
            report_failure(&backend, task.action_id, e.to_string(), None).await;
            return;
        }
    };

    let input = task.input_body.clone().unwrap_or(Value::Null);
    let action_future = handler(input);

    let outcome = match min_soft_limit(&task.timeouts) {
        Some(first_deadline) => {
            tokio::select! {
                result = action_future => Some(result),
                _ = soft_timeout_sentinel(first_deadline, &state) => None,
            }
        }
        None => Some(action_future.await),
    };

    match outcome {
        Some(Ok(result_body)) => {
            debug!(action_id = %task.action_id, "task completed");
            report_success(&backend, task.action_id, result_body).await;
        }
        Some(Err(e)) => {
            debug!(action_id = %task.action_id, "task raised: {}", e.message);
            report_failure(&backend, task.action_id, e.message, e.stack).await;
        }
        None => {
            debug!(action_id = %task.action_id, "task cancelled by soft deadline");
            report_failure(&backend, task.action_id, SOFT_TIMEOUT_MARKER.to_string(), None).await;
        }
    }
}

/// Sleeps to the earliest soft deadline, then polls for the watcher's flag.
/// Winning the race drops the action future at its next suspension point.
async fn soft_timeout_sentinel(first_deadline: Duration, state: &ThreadState) {
    tokio::time::sleep(first_deadline).await;
    loop {
        if state.is_flagged(TimeoutKind::Soft) {
            return;
        }
        tokio::time::sleep(SOFT_POLL_INTERVAL).await;
    }
}

async fn report_success(backend: &Arc<dyn QueueBackend>, action_id: Uuid, result_body: Value) {
    let outcome = ActionOutcome::Success { result_body };
    match with_db_retries("report success", || {
        backend.append_result(action_id, outcome.clone())
    })
    .await
    {
        Ok(_) => {}
        Err(StoreError::AlreadyFinal(_)) => {
            debug!(%action_id, "terminal result already recorded");
        }
        Err(e) => error!(%action_id, "failed to report success: {}", e),
    }
}

async fn report_failure(
    backend: &Arc<dyn QueueBackend>,
    action_id: Uuid,
    exception: String,
    exception_stack: Option<String>,
) {
    let outcome = ActionOutcome::Failure {
        exception,
        exception_stack,
    };
    match with_db_retries("report failure", || {
        backend.append_result(action_id, outcome.clone())
    })
    .await
    {
        Ok(_) => {}
        Err(StoreError::AlreadyFinal(_)) => {
            debug!(%action_id, "terminal result already recorded");
        }
        Err(e) => error!(%action_id, "failed to report failure: {}", e),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, NewAction, NewInstance, QueueStatus};
    use crate::registry::RegistryBuilder;
    use crate::reliability::RetryPolicy;
    use crate::worker::shared_receiver;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_action("inc", |x: i64| async move { Ok(x + 1) });
        builder.register_action("sleepy", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("finished"))
        });
        builder.register_action("spin", |_: Value| async move {
            // Saturates the thread without ever yielding to the scheduler
            let mut x: u64 = 0;
            loop {
                x = x.wrapping_add(1);
                if x == u64::MAX {
                    break;
                }
                std::hint::spin_loop();
            }
            Ok(json!(x))
        });
        builder.build()
    }

    async fn seed_action(
        backend: &InMemoryQueue,
        registry: &Registry,
        action_name: &str,
        input: Value,
        timeouts: Vec<TimeoutDefinition>,
        retry: RetryPolicy,
    ) -> TaskDefinition {
        let instance_id = backend
            .enqueue_instance(NewInstance {
                workflow_name: "wf".into(),
                registry_id: "r".into(),
                input_body: json!({}),
                schedule_after: None,
            })
            .await
            .unwrap();

        let registry_id = registry.action_id_for(action_name).unwrap().to_string();
        let action_id = backend
            .enqueue_action(NewAction {
                instance_id,
                workflow_name: "wf".into(),
                step_key: format!("step-{action_name}"),
                registry_id: registry_id.clone(),
                input_body: Some(input.clone()),
                retry,
                timeouts: timeouts.clone(),
                schedule_after: None,
            })
            .await
            .unwrap();

        TaskDefinition {
            action_id,
            registry_id,
            input_body: Some(input),
            timeouts,
        }
    }

    fn fast_config() -> ActionWorkerConfig {
        ActionWorkerConfig::new(2)
            .with_ping_interval(Duration::from_millis(50))
            .with_watch_interval(Duration::from_millis(50))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_executes_task_and_reports_success() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = test_registry();

        let (tx, rx) = mpsc::channel(8);
        let handle = ActionWorker::spawn(
            backend.clone() as Arc<dyn QueueBackend>,
            Arc::clone(&registry),
            shared_receiver(rx),
            fast_config(),
        );

        let task = seed_action(&backend, &registry, "inc", json!(41), vec![], RetryPolicy::no_retry()).await;
        let action_id = task.action_id;
        tx.send(task).await.unwrap();

        let row = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let row = backend.fetch_action(action_id).await.unwrap();
                if row.status == QueueStatus::Done {
                    break row;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should complete");

        let result = backend.fetch_result(row.final_result_id.unwrap()).await.unwrap();
        assert_eq!(result.result_body, Some(json!(42)));

        handle.request_shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_soft_timeout_cancels_cooperative_task() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = test_registry();

        let (tx, rx) = mpsc::channel(8);
        let handle = ActionWorker::spawn(
            backend.clone() as Arc<dyn QueueBackend>,
            Arc::clone(&registry),
            shared_receiver(rx),
            fast_config(),
        );

        // Sleeps 30s; soft wall deadline at 100ms; retries remain so the
        // failed attempt is re-scheduled
        let task = seed_action(
            &backend,
            &registry,
            "sleepy",
            json!(30_000),
            vec![TimeoutDefinition::wall_soft(Duration::from_millis(100))],
            RetryPolicy::exponential().with_max_attempts(3).with_backoff_seconds(60.0),
        )
        .await;
        let action_id = task.action_id;
        let started = chrono::Utc::now();
        tx.send(task).await.unwrap();

        let row = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let row = backend.fetch_action(action_id).await.unwrap();
                if row.status == QueueStatus::Scheduled {
                    break row;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("soft timeout should re-schedule the action");

        assert_eq!(row.retry_current_attempt, 1);
        assert!(row.schedule_after.unwrap() > started);
        assert!(row.final_result_id.is_none());

        let results = backend.results_for_action(action_id);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exception.as_deref(), Some(SOFT_TIMEOUT_MARKER));

        // The worker itself is unaffected by a soft timeout
        assert!(!handle.is_draining());
        handle.request_shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hard_timeout_drains_worker() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = test_registry();

        let (tx, rx) = mpsc::channel(8);
        let handle = ActionWorker::spawn(
            backend.clone() as Arc<dyn QueueBackend>,
            Arc::clone(&registry),
            shared_receiver(rx),
            fast_config(),
        );

        // Spins forever; CPU deadlines soft 100ms / hard 300ms
        let task = seed_action(
            &backend,
            &registry,
            "spin",
            json!(null),
            vec![
                TimeoutDefinition::cpu_soft(Duration::from_millis(100)),
                TimeoutDefinition::cpu_hard(Duration::from_millis(300)),
            ],
            RetryPolicy::no_retry(),
        )
        .await;
        let action_id = task.action_id;
        tx.send(task).await.unwrap();

        // The worker must flag draining and exit on its own
        tokio::time::timeout(Duration::from_secs(7), async {
            loop {
                if handle.is_draining() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("hard timeout should drain the worker");

        tokio::time::timeout(Duration::from_secs(7), async {
            loop {
                if !handle.is_alive() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("draining worker should exit");

        let row = backend.fetch_action(action_id).await.unwrap();
        assert_eq!(row.status, QueueStatus::Done);
        let result = backend.fetch_result(row.final_result_id.unwrap()).await.unwrap();
        assert_eq!(result.exception.as_deref(), Some(HARD_TIMEOUT_MARKER));

        // The spinning thread outlives the worker and must be accounted for
        assert!(leaked_task_threads() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recycle_threshold_drains_worker() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = test_registry();

        let (tx, rx) = mpsc::channel(8);
        let handle = ActionWorker::spawn(
            backend.clone() as Arc<dyn QueueBackend>,
            Arc::clone(&registry),
            shared_receiver(rx),
            fast_config().with_tasks_before_recycle(1),
        );

        let task = seed_action(&backend, &registry, "inc", json!(1), vec![], RetryPolicy::no_retry()).await;
        tx.send(task).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.is_draining() && !handle.is_alive() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker should recycle after one task");
    }

    #[test]
    fn test_config_builder() {
        let config = ActionWorkerConfig::new(4)
            .with_ping_interval(Duration::from_secs(10))
            .with_tasks_before_recycle(100);

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.tasks_before_recycle, Some(100));
    }

    #[test]
    fn test_task_definition_serialization() {
        let task = TaskDefinition {
            action_id: Uuid::now_v7(),
            registry_id: "abc".into(),
            input_body: Some(json!({"x": 1})),
            timeouts: vec![TimeoutDefinition::wall_soft(Duration::from_secs(3))],
        };

        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.action_id, task.action_id);
        assert_eq!(parsed.timeouts, task.timeouts);
    }
}

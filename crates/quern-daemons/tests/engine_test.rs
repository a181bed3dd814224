//! End-to-end engine tests over the in-memory queue backend
//!
//! These drive the full stack: client submission, the daemon runner's
//! dispatch/housekeeping/health loops, instance workers replaying
//! workflows, and action workers executing under deadlines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use quern_daemons::prelude::*;
use quern_daemons::queue::{ActionOutcome, NewAction, NewInstance};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FanInput {
    n: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct FanOutput {
    value: i64,
}

/// Launches three concurrent increments, sums them, then doubles the sum.
struct FanOutWorkflow;

#[async_trait]
impl Workflow for FanOutWorkflow {
    const NAME: &'static str = "fan_out";
    type Input = FanInput;
    type Output = FanOutput;

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError> {
        let n1 = input.n + 1;
        let n2 = input.n + 2;
        let (a, b, c) = tokio::try_join!(
            ctx.run_action::<i64, i64>("inc-1", "inc", &input.n, ActionOptions::new()),
            ctx.run_action::<i64, i64>("inc-2", "inc", &n1, ActionOptions::new()),
            ctx.run_action::<i64, i64>("inc-3", "inc", &n2, ActionOptions::new()),
        )?;

        let sum = a + b + c;
        let doubled: i64 = ctx
            .run_action("double", "double", &sum, ActionOptions::new())
            .await?;

        Ok(FanOutput { value: doubled })
    }
}

/// Calls one flaky action with retries.
struct FlakyWorkflow;

#[async_trait]
impl Workflow for FlakyWorkflow {
    const NAME: &'static str = "flaky_flow";
    type Input = serde_json::Value;
    type Output = String;

    async fn run(
        &self,
        ctx: &WorkflowContext,
        _input: Self::Input,
    ) -> Result<Self::Output, WorkflowError> {
        let options = ActionOptions::new().with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_backoff_seconds(0.01)
                .with_backoff_factor(2.0)
                .with_jitter_seconds(0.0),
        );

        let out: String = ctx.run_action("flaky-step", "flaky", &json!(null), options).await?;
        Ok(out)
    }
}

/// Five sequential increments; each step's result feeds the next.
struct FiveStepsWorkflow;

#[async_trait]
impl Workflow for FiveStepsWorkflow {
    const NAME: &'static str = "five_steps";
    type Input = i64;
    type Output = i64;

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError> {
        let mut acc = input;
        for step in 1..=5 {
            acc = ctx
                .run_action(&format!("step-{step}"), "inc", &acc, ActionOptions::new())
                .await?;
        }
        Ok(acc)
    }
}

/// Calls the spinning action under a CPU hard deadline.
struct SpinWorkflow;

#[async_trait]
impl Workflow for SpinWorkflow {
    const NAME: &'static str = "spin_flow";
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    async fn run(
        &self,
        ctx: &WorkflowContext,
        _input: Self::Input,
    ) -> Result<Self::Output, WorkflowError> {
        let options = ActionOptions::new()
            .with_timeout(TimeoutDefinition::cpu_soft(Duration::from_millis(100)))
            .with_timeout(TimeoutDefinition::cpu_hard(Duration::from_millis(400)));

        let out: serde_json::Value = ctx
            .run_action("spin-step", "spin", &json!(null), options)
            .await?;
        Ok(out)
    }
}

fn build_registry(flaky_attempts: Arc<AtomicU32>) -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();

    builder.register_action("inc", |x: i64| async move { Ok(x + 1) });
    builder.register_action("double", |x: i64| async move { Ok(2 * x) });

    builder.register_action("flaky", move |_: serde_json::Value| {
        let attempts = Arc::clone(&flaky_attempts);
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(ActionError::new("boom"))
            } else {
                Ok("ok".to_string())
            }
        }
    });

    builder.register_action("spin", |_: serde_json::Value| async move {
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

    builder.register_workflow(FanOutWorkflow);
    builder.register_workflow(FlakyWorkflow);
    builder.register_workflow(FiveStepsWorkflow);
    builder.register_workflow(SpinWorkflow);

    builder.build()
}

fn fast_runner_config() -> DaemonRunnerConfig {
    DaemonRunnerConfig::new()
        .with_action_workers(2, 2)
        .with_instance_workers(1, 16)
        .with_update_scheduled_refresh(Duration::from_millis(50))
        .with_update_timed_out_workers_refresh(Duration::from_millis(200))
        .with_worker_timeout(Duration::from_secs(60))
        .with_health_check_interval(Duration::from_millis(100))
        .with_ping_interval(Duration::from_millis(100))
        .with_result_poll_interval(Duration::from_millis(25))
        .with_shutdown_grace(Duration::from_secs(5))
}

struct Harness {
    backend: Arc<InMemoryQueue>,
    client: DaemonClient,
    runner: Arc<DaemonRunner>,
    running: tokio::task::JoinHandle<Result<(), RunnerError>>,
}

impl Harness {
    fn start(registry: Arc<Registry>, config: DaemonRunnerConfig) -> Self {
        let backend = Arc::new(InMemoryQueue::new());
        let client = DaemonClient::new(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            Arc::clone(&registry),
        )
        .with_poll_interval(Duration::from_millis(20));

        let runner = Arc::new(DaemonRunner::new(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            registry,
            config,
        ));
        let running = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.run().await }
        });

        Self {
            backend,
            client,
            runner,
            running,
        }
    }

    async fn stop(self) {
        self.runner.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.running).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_fan_out() {
    let registry = build_registry(Arc::new(AtomicU32::new(0)));
    let harness = Harness::start(registry, fast_runner_config());

    let handle = harness
        .client
        .enqueue_workflow::<FanOutWorkflow>(FanInput { n: 1 })
        .await
        .unwrap();

    // inc(1) + inc(2) + inc(3) = 2 + 3 + 4 = 9, doubled = 18
    let output = handle
        .await_result(Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(output, FanOutput { value: 18 });

    // Four action rows, one per step key
    let actions = harness.backend.actions_for_instance(handle.id());
    assert_eq!(actions.len(), 4);
    let mut step_keys: Vec<_> = actions.iter().map(|a| a.step_key.clone()).collect();
    step_keys.sort();
    assert_eq!(step_keys, vec!["double", "inc-1", "inc-2", "inc-3"]);

    for action in &actions {
        assert_eq!(action.status, QueueStatus::Done);
        assert!(action.final_result_id.is_some());
    }

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_action_retries_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let registry = build_registry(Arc::clone(&attempts));
    let harness = Harness::start(registry, fast_runner_config());

    let handle = harness
        .client
        .enqueue_workflow::<FlakyWorkflow>(json!(null))
        .await
        .unwrap();

    let output = handle
        .await_result(Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(output, "ok");

    // Exactly three attempts ran
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let actions = harness.backend.actions_for_instance(handle.id());
    assert_eq!(actions.len(), 1);
    let action = &actions[0];
    assert_eq!(action.retry_current_attempt, 3);
    assert_eq!(action.status, QueueStatus::Done);

    // Two failures then one success, append-only
    let results = harness.backend.results_for_action(action.id);
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].exception.as_deref(), Some("boom"));
    assert_eq!(results[1].exception.as_deref(), Some("boom"));
    assert_eq!(results[2].result_body, Some(json!("ok")));
    assert_eq!(action.final_result_id, Some(results[2].id));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replay_reuses_cached_results() {
    let registry = build_registry(Arc::new(AtomicU32::new(0)));
    let backend = Arc::new(InMemoryQueue::new());

    // Simulate a prior worker that completed the first three steps before
    // dying: the instance row is back in the queue and its actions are done
    let workflow_registry_id = registry.workflow_id_for("five_steps").unwrap().to_string();
    let inc_registry_id = registry.action_id_for("inc").unwrap().to_string();

    let instance_id = backend
        .enqueue_instance(NewInstance {
            workflow_name: "five_steps".into(),
            registry_id: workflow_registry_id,
            input_body: json!(0),
            schedule_after: None,
        })
        .await
        .unwrap();

    for step in 1..=3i64 {
        let action_id = backend
            .enqueue_action(NewAction {
                instance_id,
                workflow_name: "five_steps".into(),
                step_key: format!("step-{step}"),
                registry_id: inc_registry_id.clone(),
                input_body: Some(json!(step - 1)),
                retry: RetryPolicy::no_retry(),
                timeouts: vec![],
                schedule_after: None,
            })
            .await
            .unwrap();
        backend
            .append_result(
                action_id,
                ActionOutcome::Success {
                    result_body: json!(step),
                },
            )
            .await
            .unwrap();
    }

    // A fresh runner picks the instance up and replays it
    let runner = Arc::new(DaemonRunner::new(
        Arc::clone(&backend) as Arc<dyn QueueBackend>,
        Arc::clone(&registry),
        fast_runner_config(),
    ));
    let running = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.run().await }
    });

    let row = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let row = backend.fetch_instance(instance_id).await.unwrap();
            if row.status == QueueStatus::Done {
                break row;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replayed instance should complete");

    assert!(row.error.is_none());
    assert_eq!(row.output_body, Some(json!(5)));

    // Replay found the cached steps: still exactly five rows, no duplicates
    let actions = backend.actions_for_instance(instance_id);
    assert_eq!(actions.len(), 5);
    let mut step_keys: Vec<_> = actions.iter().map(|a| a.step_key.clone()).collect();
    step_keys.sort();
    step_keys.dedup();
    assert_eq!(step_keys.len(), 5);

    runner.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(10), running).await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hard_timeout_is_survived_by_the_fleet() {
    let registry = build_registry(Arc::new(AtomicU32::new(0)));
    let config = fast_runner_config().with_action_workers(1, 1);
    let harness = Harness::start(registry, config);

    let handle = harness
        .client
        .enqueue_workflow::<SpinWorkflow>(json!(null))
        .await
        .unwrap();

    // The spinning action crosses its CPU hard deadline, the only action
    // worker drains, and the workflow surfaces the terminal failure
    let result = handle.await_result(Some(Duration::from_secs(20))).await;
    match result {
        Err(ClientError::WorkflowFailed(message)) => {
            assert!(message.contains("Task hard-timed out."), "got: {message}");
        }
        other => panic!("expected workflow failure, got {other:?}"),
    }

    // The health loop replaces the drained worker
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (action_workers, _) = harness.runner.worker_counts();
            if action_workers >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("a replacement action worker should appear");

    // The spinning thread cannot be killed in-process; the drained worker
    // must account for it instead of letting it vanish from supervision
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if quern_daemons::worker::leaked_task_threads() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the stuck thread should land on the leaked-thread gauge");

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runner_drains_cleanly_when_idle() {
    let registry = build_registry(Arc::new(AtomicU32::new(0)));
    let harness = Harness::start(registry, fast_runner_config());

    // Give the fleet a moment to boot, then shut down with nothing in flight
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (action_workers, instance_workers) = harness.runner.worker_counts();
    assert_eq!(action_workers, 2);
    assert_eq!(instance_workers, 1);

    harness.runner.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(10), harness.running)
        .await
        .expect("runner should stop within the grace period")
        .expect("runner task should not panic");
    assert!(result.is_ok());
}

//! Workflow abstractions
//!
//! A workflow is a durable, replayable driver program. Its `run` method may
//! only perform effects through [`WorkflowContext::run_action`], which
//! persists every requested action and caches its result. Because of that, a
//! crashed instance can be replayed from scratch on another worker: the same
//! sequence of `run_action` calls finds the cached results and returns
//! immediately until execution catches up to the point of failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::action::ActionOptions;
use crate::queue::{ActionRow, NewAction, QueueBackend, QueueStatus, StoreError};
use crate::registry::{Registry, RegistryError};

/// Error type for workflow failures
///
/// A workflow error is terminal: it is written to the instance row's `error`
/// column and the instance is marked done. Replaying would hit the same bug,
/// so the engine never retries it.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Why a `run_action` call did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum ActionFailure {
    /// The action exhausted its retries; the terminal result is an exception
    #[error("action failed: {exception}")]
    Failed {
        exception: String,
        exception_stack: Option<String>,
    },

    /// The requested action name is not registered
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The cached result could not be decoded as the requested type
    #[error("invalid action result: {0}")]
    Serialization(String),
}

impl From<ActionFailure> for WorkflowError {
    fn from(failure: ActionFailure) -> Self {
        WorkflowError::new(failure.to_string())
    }
}

/// A workflow is a deterministic driver program over durable actions
///
/// # Determinism
///
/// `run` must be a deterministic function of its input and the results of
/// its `run_action` calls: no direct I/O, no clocks, no randomness. Given
/// that property, replay is safe and is the only durability guarantee the
/// engine provides.
///
/// # Example
///
/// ```ignore
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl Workflow for OrderWorkflow {
///     const NAME: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     async fn run(
///         &self,
///         ctx: &WorkflowContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, WorkflowError> {
///         let validated: Validation = ctx
///             .run_action("validate", "validate_order", &input, ActionOptions::new())
///             .await?;
///         Ok(OrderResult { accepted: validated.ok })
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique name for this workflow; doubles as its queue name
    const NAME: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + 'static;

    /// Output type when the workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Execute the workflow
    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}

/// Execution context handed to a workflow's `run` method
///
/// The only supported effect is [`run_action`](WorkflowContext::run_action).
/// Each call is identified by an explicit `step_key`, stable across replays
/// and unique within the instance, which makes concurrent calls (`join!`,
/// `try_join!`) well-defined.
pub struct WorkflowContext {
    instance_id: Uuid,
    workflow_name: String,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    waiters: Arc<DashMap<Uuid, Arc<Notify>>>,
    poll_interval: Duration,
}

impl WorkflowContext {
    pub(crate) fn new(
        instance_id: Uuid,
        workflow_name: String,
        backend: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
        waiters: Arc<DashMap<Uuid, Arc<Notify>>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            instance_id,
            workflow_name,
            backend,
            registry,
            waiters,
            poll_interval,
        }
    }

    /// The id of the workflow instance being driven
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Run an action and await its terminal result.
    ///
    /// On first execution this enqueues a `daemon_action` row and suspends
    /// until a worker reports a terminal result. On replay, the existing row
    /// for `(instance_id, step_key)` is found and its cached result returned
    /// without re-executing anything.
    pub async fn run_action<I, O>(
        &self,
        step_key: &str,
        action_name: &str,
        input: &I,
        options: ActionOptions,
    ) -> Result<O, ActionFailure>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let registry_id = self.registry.action_id_for(action_name)?.to_string();

        let action_id = match self
            .backend
            .find_action_by_step(self.instance_id, step_key)
            .await?
        {
            Some(existing) => {
                if existing.status == QueueStatus::Done {
                    debug!(instance_id = %self.instance_id, step_key, "replayed cached action result");
                    return self.terminal_result(&existing).await;
                }
                existing.id
            }
            None => {
                let input_body = serde_json::to_value(input)
                    .map_err(|e| ActionFailure::Serialization(e.to_string()))?;

                self.backend
                    .enqueue_action(NewAction {
                        instance_id: self.instance_id,
                        workflow_name: self.workflow_name.clone(),
                        step_key: step_key.to_string(),
                        registry_id,
                        input_body: Some(input_body),
                        retry: options.retry,
                        timeouts: options.timeouts,
                        schedule_after: None,
                    })
                    .await?
            }
        };

        let notify = {
            let entry = self
                .waiters
                .entry(action_id)
                .or_insert_with(|| Arc::new(Notify::new()));
            Arc::clone(entry.value())
        };

        // Re-check the row after every wake-up; the fallback poll interval
        // covers a notification lost between the lookup and the wait.
        let row = loop {
            let row = self.backend.fetch_action(action_id).await?;
            if row.status == QueueStatus::Done {
                break row;
            }
            let _ = tokio::time::timeout(self.poll_interval, notify.notified()).await;
        };

        self.waiters.remove(&action_id);
        self.terminal_result(&row).await
    }

    /// Decode the terminal result of a done action row
    async fn terminal_result<O: DeserializeOwned>(
        &self,
        row: &ActionRow,
    ) -> Result<O, ActionFailure> {
        let result_id = row.final_result_id.ok_or_else(|| {
            ActionFailure::Serialization(format!(
                "done action {} has no final result",
                row.id
            ))
        })?;

        let result = self.backend.fetch_result(result_id).await?;

        if let Some(exception) = result.exception {
            return Err(ActionFailure::Failed {
                exception,
                exception_stack: result.exception_stack,
            });
        }

        let body = result.result_body.ok_or_else(|| {
            ActionFailure::Serialization(format!("result {} has neither body nor exception", result_id))
        })?;

        serde_json::from_value(body).map_err(|e| ActionFailure::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ActionOutcome, InMemoryQueue, NewInstance};
    use crate::registry::RegistryBuilder;
    use crate::reliability::RetryPolicy;
    use serde_json::json;

    fn context_over(backend: Arc<InMemoryQueue>, registry: Arc<Registry>, instance_id: Uuid) -> WorkflowContext {
        WorkflowContext::new(
            instance_id,
            "wf".into(),
            backend,
            registry,
            Arc::new(DashMap::new()),
            Duration::from_millis(10),
        )
    }

    fn inc_registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_action("inc", |x: i64| async move { Ok(x + 1) });
        builder.build()
    }

    async fn seeded_instance(backend: &InMemoryQueue) -> Uuid {
        backend
            .enqueue_instance(NewInstance {
                workflow_name: "wf".into(),
                registry_id: "r".into(),
                input_body: json!({}),
                schedule_after: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_action_enqueues_and_resolves() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = inc_registry();
        let instance_id = seeded_instance(&backend).await;
        let ctx = context_over(Arc::clone(&backend), registry, instance_id);

        let run = tokio::spawn(async move {
            ctx.run_action::<i64, i64>("s1", "inc", &41, ActionOptions::new())
                .await
        });

        // Let run_action insert the row, then resolve it as a worker would
        let action = loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(row) = backend.find_action_by_step(instance_id, "s1").await.unwrap() {
                break row;
            }
        };
        backend
            .append_result(
                action.id,
                ActionOutcome::Success {
                    result_body: json!(42),
                },
            )
            .await
            .unwrap();

        assert_eq!(run.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_action_replays_cached_result() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = inc_registry();
        let instance_id = seeded_instance(&backend).await;

        // First execution
        {
            let ctx = context_over(Arc::clone(&backend), Arc::clone(&registry), instance_id);
            let run = tokio::spawn(async move {
                ctx.run_action::<i64, i64>("s1", "inc", &1, ActionOptions::new())
                    .await
            });
            let action = loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if let Some(row) = backend.find_action_by_step(instance_id, "s1").await.unwrap() {
                    break row;
                }
            };
            backend
                .append_result(
                    action.id,
                    ActionOutcome::Success {
                        result_body: json!(2),
                    },
                )
                .await
                .unwrap();
            run.await.unwrap().unwrap();
        }

        // Replay: returns immediately from the cache, no second row
        let ctx = context_over(Arc::clone(&backend), registry, instance_id);
        let replayed: i64 = ctx
            .run_action("s1", "inc", &1, ActionOptions::new())
            .await
            .unwrap();

        assert_eq!(replayed, 2);
        assert_eq!(backend.actions_for_instance(instance_id).len(), 1);
    }

    #[tokio::test]
    async fn test_run_action_surfaces_terminal_exception() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = inc_registry();
        let instance_id = seeded_instance(&backend).await;
        let ctx = context_over(Arc::clone(&backend), registry, instance_id);

        let run = tokio::spawn(async move {
            ctx.run_action::<i64, i64>(
                "s1",
                "inc",
                &1,
                ActionOptions::new().with_retry(RetryPolicy::no_retry()),
            )
            .await
        });

        let action = loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(row) = backend.find_action_by_step(instance_id, "s1").await.unwrap() {
                break row;
            }
        };
        backend
            .append_result(
                action.id,
                ActionOutcome::Failure {
                    exception: "boom".into(),
                    exception_stack: None,
                },
            )
            .await
            .unwrap();

        let failure = run.await.unwrap().unwrap_err();
        assert!(matches!(failure, ActionFailure::Failed { ref exception, .. } if exception == "boom"));
    }

    #[tokio::test]
    async fn test_unknown_action_name() {
        let backend = Arc::new(InMemoryQueue::new());
        let registry = inc_registry();
        let instance_id = seeded_instance(&backend).await;
        let ctx = context_over(backend, registry, instance_id);

        let result = ctx
            .run_action::<i64, i64>("s1", "missing", &1, ActionOptions::new())
            .await;
        assert!(matches!(result, Err(ActionFailure::Registry(_))));
    }

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong").with_code("E_BAD");
        assert_eq!(error.to_string(), "something went wrong");
        assert_eq!(error.code, Some("E_BAD".to_string()));
    }
}

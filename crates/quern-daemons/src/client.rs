//! Client submission API
//!
//! External collaborators enqueue workflows through [`DaemonClient`] and
//! await their results through the returned [`InstanceHandle`]. Submission
//! only writes a row; execution happens wherever a daemon runner serves the
//! workflow's queue.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::queue::{NewInstance, QueueBackend, QueueStatus, StoreError};
use crate::registry::{Registry, RegistryError};
use crate::workflow::Workflow;

/// Errors surfaced to submitting clients
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The workflow type is not registered
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Input or output could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The workflow ended with a terminal error
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    /// `await_result` gave up before the instance finished
    #[error("timed out waiting for instance {0}")]
    Timeout(Uuid),
}

/// Interacts with a daemon deployment from client code
#[derive(Clone)]
pub struct DaemonClient {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    poll_interval: Duration,
}

impl DaemonClient {
    /// Create a client over the shared queue backend
    pub fn new(backend: Arc<dyn QueueBackend>, registry: Arc<Registry>) -> Self {
        Self {
            backend,
            registry,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set how often `await_result` re-checks the instance row
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Queue a new invocation of a registered workflow
    pub async fn enqueue_workflow<W: Workflow>(
        &self,
        input: W::Input,
    ) -> Result<InstanceHandle<W>, ClientError> {
        let registry_id = self.registry.workflow_id_for(W::NAME)?.to_string();
        let input_body =
            serde_json::to_value(&input).map_err(|e| ClientError::Serialization(e.to_string()))?;

        let id = self
            .backend
            .enqueue_instance(NewInstance {
                workflow_name: W::NAME.to_string(),
                registry_id,
                input_body,
                schedule_after: None,
            })
            .await?;

        debug!(%id, workflow = W::NAME, "enqueued workflow");
        Ok(InstanceHandle {
            id,
            backend: Arc::clone(&self.backend),
            poll_interval: self.poll_interval,
            _workflow: PhantomData,
        })
    }
}

/// Handle to one enqueued workflow instance
pub struct InstanceHandle<W: Workflow> {
    id: Uuid,
    backend: Arc<dyn QueueBackend>,
    poll_interval: Duration,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow> InstanceHandle<W> {
    /// The instance row id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the instance to reach its terminal state.
    ///
    /// Surfaces the decoded output on success, the terminal error on
    /// workflow failure, or [`ClientError::Timeout`] if `timeout` elapses
    /// first (None waits forever).
    pub async fn await_result(&self, timeout: Option<Duration>) -> Result<W::Output, ClientError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let row = self.backend.fetch_instance(self.id).await?;
            if row.status == QueueStatus::Done {
                if let Some(error) = row.error {
                    return Err(ClientError::WorkflowFailed(error));
                }
                let output = row.output_body.ok_or_else(|| {
                    ClientError::Serialization(format!(
                        "done instance {} has neither output nor error",
                        self.id
                    ))
                })?;
                return serde_json::from_value(output)
                    .map_err(|e| ClientError::Serialization(e.to_string()));
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ClientError::Timeout(self.id));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::registry::RegistryBuilder;
    use crate::workflow::{WorkflowContext, WorkflowError};
    use async_trait::async_trait;
    use serde_json::json;

    struct PassThrough;

    #[async_trait]
    impl Workflow for PassThrough {
        const NAME: &'static str = "pass_through";
        type Input = serde_json::Value;
        type Output = serde_json::Value;

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Ok(input)
        }
    }

    fn client_over(backend: Arc<InMemoryQueue>) -> DaemonClient {
        let mut builder = RegistryBuilder::new();
        builder.register_workflow(PassThrough);
        DaemonClient::new(backend, builder.build()).with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_enqueue_inserts_queued_row() {
        let backend = Arc::new(InMemoryQueue::new());
        let client = client_over(Arc::clone(&backend));

        let handle = client
            .enqueue_workflow::<PassThrough>(json!({"n": 1}))
            .await
            .unwrap();

        let row = backend.fetch_instance(handle.id()).await.unwrap();
        assert_eq!(row.status, QueueStatus::Queued);
        assert_eq!(row.workflow_name, "pass_through");
        assert_eq!(row.input_body, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_await_result_times_out() {
        let backend = Arc::new(InMemoryQueue::new());
        let client = client_over(Arc::clone(&backend));

        let handle = client
            .enqueue_workflow::<PassThrough>(json!({}))
            .await
            .unwrap();

        let result = handle.await_result(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_await_result_surfaces_output_and_error() {
        let backend = Arc::new(InMemoryQueue::new());
        let client = client_over(Arc::clone(&backend));

        let ok = client
            .enqueue_workflow::<PassThrough>(json!({}))
            .await
            .unwrap();
        backend
            .complete_instance(ok.id(), json!({"v": 7}))
            .await
            .unwrap();
        assert_eq!(
            ok.await_result(Some(Duration::from_secs(1))).await.unwrap(),
            json!({"v": 7})
        );

        let failed = client
            .enqueue_workflow::<PassThrough>(json!({}))
            .await
            .unwrap();
        backend.fail_instance(failed.id(), "exploded").await.unwrap();
        let err = failed.await_result(Some(Duration::from_secs(1))).await;
        assert!(matches!(err, Err(ClientError::WorkflowFailed(ref m)) if m == "exploded"));
    }

    #[tokio::test]
    async fn test_unregistered_workflow_is_rejected() {
        struct Unregistered;

        #[async_trait]
        impl Workflow for Unregistered {
            const NAME: &'static str = "unregistered";
            type Input = serde_json::Value;
            type Output = serde_json::Value;

            async fn run(
                &self,
                _ctx: &WorkflowContext,
                input: Self::Input,
            ) -> Result<Self::Output, WorkflowError> {
                Ok(input)
            }
        }

        let backend = Arc::new(InMemoryQueue::new());
        let client = client_over(backend);

        let result = client.enqueue_workflow::<Unregistered>(json!({})).await;
        assert!(matches!(result, Err(ClientError::Registry(_))));
    }
}

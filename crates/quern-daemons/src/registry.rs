//! Registry of actions and workflows
//!
//! The registry maps stable `registry_id`s to type-erased callables so that
//! workers can execute work without knowing concrete types. It is populated
//! once at startup through [`RegistryBuilder`] and then frozen: workers
//! receive an immutable [`Registry`] behind an `Arc`, and no registration
//! can happen after they start.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::action::ActionError;
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Type-erased action callable: JSON input to JSON output
pub type ActionHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ActionError>> + Send + Sync>;

/// Type-erased workflow driver: runs `Workflow::run` against a context
pub type WorkflowDriver = Arc<
    dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, WorkflowError>>
        + Send
        + Sync,
>;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No callable registered under this id
    #[error("unknown registry id: {0}")]
    UnknownRegistryId(String),

    /// No action registered under this name
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// No workflow registered under this name
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
}

/// Derive the stable cross-process identifier for a registered callable.
///
/// Both the submitting process and every worker compute the same id from the
/// registered name alone, so rows written by one process resolve in another.
fn derive_registry_id(kind: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

struct ActionEntry {
    name: String,
    handler: ActionHandler,
}

struct WorkflowEntry {
    name: String,
    driver: WorkflowDriver,
}

/// Builder for the process-wide registry
///
/// # Example
///
/// ```ignore
/// let mut builder = RegistryBuilder::new();
/// builder.register_action("inc", |input: IncInput| async move {
///     Ok(IncOutput { value: input.value + 1 })
/// });
/// builder.register_workflow(MyWorkflow);
/// let registry = builder.build();
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    actions: HashMap<String, ActionEntry>,
    workflows: HashMap<String, WorkflowEntry>,
}

impl RegistryBuilder {
    /// Create a new empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed action under a stable name
    ///
    /// The wrapper closure parses the stored `input_body` as `I` (the
    /// declared input schema) and serializes the output back to JSON.
    pub fn register_action<F, Fut, I, O>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActionError>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ActionHandler = Arc::new(move |raw: Value| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let input: I = serde_json::from_value(raw)
                    .map_err(|e| ActionError::new(format!("invalid action input: {e}")))?;
                let output = handler(input).await?;
                serde_json::to_value(output)
                    .map_err(|e| ActionError::new(format!("unserializable action output: {e}")))
            })
        });

        let registry_id = derive_registry_id("action", name);
        self.actions.insert(
            registry_id,
            ActionEntry {
                name: name.to_string(),
                handler: erased,
            },
        );
        self
    }

    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        let workflow = Arc::new(workflow);
        let driver: WorkflowDriver = Arc::new(move |ctx: WorkflowContext, raw: Value| {
            let workflow = Arc::clone(&workflow);
            Box::pin(async move {
                let input: W::Input = serde_json::from_value(raw).map_err(|e| {
                    WorkflowError::new(format!("invalid workflow input: {e}"))
                })?;
                let output = workflow.run(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    WorkflowError::new(format!("unserializable workflow output: {e}"))
                })
            })
        });

        let registry_id = derive_registry_id("workflow", W::NAME);
        self.workflows.insert(
            registry_id,
            WorkflowEntry {
                name: W::NAME.to_string(),
                driver,
            },
        );
        self
    }

    /// Freeze the builder into an immutable registry
    pub fn build(self) -> Arc<Registry> {
        let action_ids = self
            .actions
            .iter()
            .map(|(id, entry)| (entry.name.clone(), id.clone()))
            .collect();
        let workflow_ids = self
            .workflows
            .iter()
            .map(|(id, entry)| (entry.name.clone(), id.clone()))
            .collect();

        Arc::new(Registry {
            actions: self.actions,
            workflows: self.workflows,
            action_ids,
            workflow_ids,
        })
    }
}

/// Frozen, process-wide registry handed to workers at spawn time
pub struct Registry {
    actions: HashMap<String, ActionEntry>,
    workflows: HashMap<String, WorkflowEntry>,
    action_ids: HashMap<String, String>,
    workflow_ids: HashMap<String, String>,
}

impl Registry {
    /// Look up an action handler by registry id
    pub fn action(&self, registry_id: &str) -> Result<ActionHandler, RegistryError> {
        self.actions
            .get(registry_id)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| RegistryError::UnknownRegistryId(registry_id.to_string()))
    }

    /// Look up a workflow driver by registry id
    pub fn workflow(&self, registry_id: &str) -> Result<WorkflowDriver, RegistryError> {
        self.workflows
            .get(registry_id)
            .map(|entry| Arc::clone(&entry.driver))
            .ok_or_else(|| RegistryError::UnknownRegistryId(registry_id.to_string()))
    }

    /// Registry id for a registered action name
    pub fn action_id_for(&self, name: &str) -> Result<&str, RegistryError> {
        self.action_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::UnknownAction(name.to_string()))
    }

    /// Registry id for a registered workflow name
    pub fn workflow_id_for(&self, name: &str) -> Result<&str, RegistryError> {
        self.workflow_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    /// Number of registered actions
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Number of registered workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Registered action names
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.action_ids.keys().map(String::as_str)
    }

    /// Registered workflow names
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflow_ids.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("actions", &self.action_ids.keys().collect::<Vec<_>>())
            .field("workflows", &self.workflow_ids.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct IncInput {
        x: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct NoopInput {
        tag: String,
    }

    struct NoopWorkflow;

    #[async_trait]
    impl Workflow for NoopWorkflow {
        const NAME: &'static str = "noop";
        type Input = NoopInput;
        type Output = NoopInput;

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Ok(input)
        }
    }

    fn test_registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_action("inc", |input: IncInput| async move {
            Ok(json!(input.x + 1))
        });
        builder.register_workflow(NoopWorkflow);
        builder.build()
    }

    #[test]
    fn test_registry_ids_are_deterministic() {
        assert_eq!(
            derive_registry_id("action", "inc"),
            derive_registry_id("action", "inc")
        );
        assert_ne!(
            derive_registry_id("action", "inc"),
            derive_registry_id("workflow", "inc")
        );
        assert_eq!(derive_registry_id("action", "inc").len(), 32);
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let registry = test_registry();

        let action_id = registry.action_id_for("inc").unwrap().to_string();
        assert!(registry.action(&action_id).is_ok());

        let workflow_id = registry.workflow_id_for("noop").unwrap().to_string();
        assert!(registry.workflow(&workflow_id).is_ok());

        assert_eq!(registry.action_count(), 1);
        assert_eq!(registry.workflow_count(), 1);
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = test_registry();

        assert!(matches!(
            registry.action("missing"),
            Err(RegistryError::UnknownRegistryId(_))
        ));
        assert!(matches!(
            registry.action_id_for("missing"),
            Err(RegistryError::UnknownAction(_))
        ));
        assert!(matches!(
            registry.workflow_id_for("missing"),
            Err(RegistryError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_action_handler_parses_input() {
        let registry = test_registry();
        let action_id = registry.action_id_for("inc").unwrap().to_string();
        let handler = registry.action(&action_id).unwrap();

        let output = handler(json!({"x": 41})).await.unwrap();
        assert_eq!(output, json!(42));

        let err = handler(json!({"y": 1})).await.unwrap_err();
        assert!(err.message.contains("invalid action input"));
    }

    #[test]
    fn test_workflow_input_roundtrip() {
        // decode(encode(input)) == input for the registered input schema
        let input = NoopInput { tag: "t".into() };
        let encoded = serde_json::to_value(&input).unwrap();
        let decoded: NoopInput = serde_json::from_value(encoded).unwrap();
        assert_eq!(input, decoded);
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = test_registry();
        let debug = format!("{registry:?}");
        assert!(debug.contains("inc"));
        assert!(debug.contains("noop"));
    }
}

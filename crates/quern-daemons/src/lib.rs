//! # Durable Daemon Runtime
//!
//! A PostgreSQL-backed workflow-and-action execution engine for reliable,
//! distributed background work.
//!
//! ## Features
//!
//! - **Replayable workflows**: every effect goes through `run_action`, is
//!   persisted, and is served from cache on replay after a crash
//! - **Exclusive claiming**: `FOR UPDATE NOWAIT` row locks let several
//!   runners share one database without double-dispatching
//! - **Deadline enforcement**: per-task wall-clock and CPU-time limits,
//!   soft (cooperative cancel) and hard (worker drain)
//! - **Automatic retries**: exponential backoff with jitter per action
//! - **Self-healing**: abandoned work is re-queued once its worker stops
//!   pinging; dead and draining workers are replaced
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DaemonRunner                           │
//! │  (dispatch loops, promote/reclaim housekeeping, health)      │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │      InstanceWorker      │      │       ActionWorker        │
//! │  (many workflows on one  │      │  (thread pool, deadline   │
//! │   cooperative scheduler) │      │   watcher, drain on hard) │
//! └──────────────────────────┘      └──────────────────────────┘
//!                │                                 │
//!                └───────────────┬─────────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueBackend                           │
//! │  (PostgreSQL: daemon_workflow_instance, daemon_action,       │
//! │   daemon_action_result, worker_status; LISTEN/NOTIFY)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use quern_daemons::prelude::*;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Workflow for Greet {
//!     const NAME: &'static str = "greet";
//!     type Input = GreetInput;
//!     type Output = GreetOutput;
//!
//!     async fn run(
//!         &self,
//!         ctx: &WorkflowContext,
//!         input: Self::Input,
//!     ) -> Result<Self::Output, WorkflowError> {
//!         let name: String = ctx
//!             .run_action("lookup", "lookup_name", &input.user_id, ActionOptions::new())
//!             .await?;
//!         Ok(GreetOutput { greeting: format!("hello, {name}") })
//!     }
//! }
//! ```

pub mod action;
pub mod client;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod runner;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::action::{ActionError, ActionOptions};
    pub use crate::client::{ClientError, DaemonClient, InstanceHandle};
    pub use crate::queue::{
        InMemoryQueue, PostgresQueue, QueueBackend, QueueStatus, QueueTable, StoreError,
    };
    pub use crate::registry::{Registry, RegistryBuilder, RegistryError};
    pub use crate::reliability::{RetryPolicy, TimeoutDefinition, TimeoutKind, TimeoutMeasure};
    pub use crate::runner::{DaemonRunner, DaemonRunnerConfig, RunnerError};
    pub use crate::worker::{ActionWorkerConfig, InstanceWorkerConfig, WorkerError};
    pub use crate::workflow::{ActionFailure, Workflow, WorkflowContext, WorkflowError};
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use action::{ActionError, ActionOptions};
pub use client::{ClientError, DaemonClient, InstanceHandle};
pub use queue::{InMemoryQueue, PostgresQueue, QueueBackend, QueueStatus, QueueTable, StoreError};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use reliability::{RetryPolicy, TimeoutDefinition, TimeoutKind, TimeoutMeasure};
pub use runner::{DaemonRunner, DaemonRunnerConfig, RunnerError};
pub use worker::{
    leaked_task_threads, ActionWorker, ActionWorkerConfig, InstanceTaskDefinition,
    InstanceWorker, InstanceWorkerConfig, TaskDefinition, WorkerError, WorkerHandle,
};
pub use workflow::{ActionFailure, Workflow, WorkflowContext, WorkflowError};

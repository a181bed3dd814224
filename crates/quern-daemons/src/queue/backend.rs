//! QueueBackend trait definition and row types

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::reliability::{RetryPolicy, TimeoutDefinition};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Action not found
    #[error("action not found: {0}")]
    ActionNotFound(Uuid),

    /// Action result not found
    #[error("action result not found: {0}")]
    ResultNotFound(Uuid),

    /// Worker status row not found
    #[error("worker not found: {0}")]
    WorkerNotFound(i64),

    /// The action already carries a terminal result; the new one was dropped
    #[error("action already has a final result: {0}")]
    AlreadyFinal(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A status string in the store is outside the closed enum
    #[error("unknown queue status: {0}")]
    UnknownStatus(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed (connection drops,
    /// serialization failures at the SQL level, lock churn).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Retry a store operation with bounded exponential backoff.
///
/// Only transient errors are retried; everything else surfaces immediately.
pub async fn with_db_retries<T, F, Fut>(op: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    const MAX_ATTEMPTS: u32 = 3;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                warn!(op, attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The two queue tables driven by the same operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTable {
    Instance,
    Action,
}

impl QueueTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Instance => "daemon_workflow_instance",
            Self::Action => "daemon_action",
        }
    }
}

/// Lifecycle status of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Ready for a claim
    Queued,

    /// Waiting for `schedule_after` to pass
    Scheduled,

    /// Claimed by exactly one worker
    InProgress,

    /// Terminal (success or exhausted failure)
    Done,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl QueueStatus {
    pub fn parse(status: &str) -> Result<Self, StoreError> {
        match status {
            "queued" => Ok(Self::Queued),
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Summary of a row that became ready, as carried by the notify channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNotification {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: QueueStatus,
}

/// Summary of a freshly appended action result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultNotification {
    pub id: Uuid,
    pub action_id: Uuid,
}

/// One invocation of a workflow
#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub id: Uuid,
    pub workflow_name: String,
    pub registry_id: String,
    pub input_body: serde_json::Value,
    pub output_body: Option<serde_json::Value>,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub launch_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub schedule_after: Option<DateTime<Utc>>,
    pub assigned_worker_status_id: Option<i64>,
}

/// One invocation of an action inside a workflow
#[derive(Debug, Clone)]
pub struct ActionRow {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub workflow_name: String,
    pub step_key: String,
    pub registry_id: String,
    pub input_body: Option<serde_json::Value>,
    pub status: QueueStatus,
    pub retry_current_attempt: i32,
    pub retry_max_attempts: i32,
    pub retry_backoff_seconds: f64,
    pub retry_backoff_factor: f64,
    pub retry_jitter: f64,
    pub wall_soft_timeout: Option<Duration>,
    pub wall_hard_timeout: Option<Duration>,
    pub cpu_soft_timeout: Option<Duration>,
    pub cpu_hard_timeout: Option<Duration>,
    pub schedule_after: Option<DateTime<Utc>>,
    pub assigned_worker_status_id: Option<i64>,
    pub final_result_id: Option<Uuid>,
    pub launch_time: DateTime<Utc>,
}

impl ActionRow {
    /// Reconstruct the retry policy from the row's columns
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1) as u32,
            backoff_seconds: self.retry_backoff_seconds,
            backoff_factor: self.retry_backoff_factor,
            jitter_seconds: self.retry_jitter,
        }
    }

    /// Reconstruct the timeout definitions from the row's columns
    pub fn timeouts(&self) -> Vec<TimeoutDefinition> {
        let mut timeouts = Vec::new();
        if let Some(limit) = self.wall_soft_timeout {
            timeouts.push(TimeoutDefinition::wall_soft(limit));
        }
        if let Some(limit) = self.wall_hard_timeout {
            timeouts.push(TimeoutDefinition::wall_hard(limit));
        }
        if let Some(limit) = self.cpu_soft_timeout {
            timeouts.push(TimeoutDefinition::cpu_soft(limit));
        }
        if let Some(limit) = self.cpu_hard_timeout {
            timeouts.push(TimeoutDefinition::cpu_hard(limit));
        }
        timeouts
    }
}

/// Outcome of one attempt of an action; append-only once written
#[derive(Debug, Clone)]
pub struct ActionResultRow {
    pub id: Uuid,
    pub action_id: Uuid,
    pub result_body: Option<serde_json::Value>,
    pub exception: Option<String>,
    pub exception_stack: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Liveness record for one worker
#[derive(Debug, Clone)]
pub struct WorkerStatusRow {
    pub id: i64,
    pub internal_process_id: Uuid,
    pub is_action_worker: bool,
    pub launch_time: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub is_draining: bool,
    pub cleaned_up: bool,
}

/// Definition of a workflow instance to be enqueued
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub workflow_name: String,
    pub registry_id: String,
    pub input_body: serde_json::Value,
    pub schedule_after: Option<DateTime<Utc>>,
}

/// Definition of an action to be enqueued
#[derive(Debug, Clone)]
pub struct NewAction {
    pub instance_id: Uuid,
    pub workflow_name: String,
    pub step_key: String,
    pub registry_id: String,
    pub input_body: Option<serde_json::Value>,
    pub retry: RetryPolicy,
    pub timeouts: Vec<TimeoutDefinition>,
    pub schedule_after: Option<DateTime<Utc>>,
}

impl NewAction {
    pub(crate) fn timeout_column(&self, want: crate::reliability::TimeoutMeasure, kind: crate::reliability::TimeoutKind) -> Option<Duration> {
        self.timeouts
            .iter()
            .find(|t| t.measure == want && t.kind == kind)
            .map(|t| t.limit)
    }
}

/// Outcome reported for one attempt of an action
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Success {
        result_body: serde_json::Value,
    },
    Failure {
        exception: String,
        exception_stack: Option<String>,
    },
}

/// Registration payload for a worker status row
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub internal_process_id: Uuid,
    pub is_action_worker: bool,
}

/// What a reclaim pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub workers_cleaned: u64,
    pub actions_requeued: u64,
    pub instances_requeued: u64,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.workers_cleaned == 0 && self.actions_requeued == 0 && self.instances_requeued == 0
    }
}

/// Durable store for workflow instances, actions, results and worker liveness
///
/// Implementations must be thread-safe and support concurrent access from
/// many workers. The same operations drive both queue tables via the
/// [`QueueTable`] parameter.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Insert a workflow instance row. Status is `queued`, or `scheduled`
    /// when `schedule_after` lies in the future. Commits on its own.
    async fn enqueue_instance(&self, row: NewInstance) -> Result<Uuid, StoreError>;

    /// Insert an action row, same status rules as [`enqueue_instance`].
    ///
    /// [`enqueue_instance`]: QueueBackend::enqueue_instance
    async fn enqueue_action(&self, row: NewAction) -> Result<Uuid, StoreError>;

    // =========================================================================
    // Streams
    // =========================================================================

    /// Stream rows that are ready to claim: first the backlog of `queued`
    /// rows, then live notifications as new rows become ready.
    ///
    /// An empty `queues` list means all queues. Dropping the receiver
    /// cancels the stream and releases its resources.
    async fn subscribe_ready(
        &self,
        table: QueueTable,
        queues: &[String],
    ) -> Result<mpsc::Receiver<ReadyNotification>, StoreError>;

    /// Stream notifications of appended action results.
    async fn subscribe_results(&self)
        -> Result<mpsc::Receiver<ResultNotification>, StoreError>;

    // =========================================================================
    // Claim and fetch
    // =========================================================================

    /// Atomically claim a queued row for the given worker.
    ///
    /// Uses a row-level lock taken with NOWAIT so that runners sharing one
    /// database never double-dispatch; exactly one caller wins.
    async fn claim_exclusive(
        &self,
        table: QueueTable,
        id: Uuid,
        worker_status_id: i64,
    ) -> Result<bool, StoreError>;

    async fn fetch_instance(&self, id: Uuid) -> Result<InstanceRow, StoreError>;

    async fn fetch_action(&self, id: Uuid) -> Result<ActionRow, StoreError>;

    async fn fetch_result(&self, id: Uuid) -> Result<ActionResultRow, StoreError>;

    /// Replay lookup: find the action a workflow issued for a given step.
    async fn find_action_by_step(
        &self,
        instance_id: Uuid,
        step_key: &str,
    ) -> Result<Option<ActionRow>, StoreError>;

    // =========================================================================
    // Results and completion
    // =========================================================================

    /// Append a result row for one attempt and transition the action in the
    /// same transaction: success or exhausted retries set `done` and
    /// `final_result_id`; a retryable failure re-schedules with backoff and
    /// leaves `final_result_id` unset. Every appended result increments
    /// `retry_current_attempt`.
    async fn append_result(
        &self,
        action_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<Uuid, StoreError>;

    /// Write the workflow output onto the instance row and mark it done.
    async fn complete_instance(
        &self,
        id: Uuid,
        output_body: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a terminal workflow error on the instance row.
    async fn fail_instance(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Worker liveness
    // =========================================================================

    /// Insert a worker status row, returning its id.
    async fn register_worker(&self, worker: NewWorker) -> Result<i64, StoreError>;

    /// Update `last_ping` and `is_draining` for a worker.
    async fn worker_ping(&self, worker_status_id: i64, is_draining: bool)
        -> Result<(), StoreError>;

    async fn fetch_worker(&self, worker_status_id: i64) -> Result<WorkerStatusRow, StoreError>;

    /// Re-bind an in-flight action row to the worker executing it.
    async fn assign_action(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError>;

    /// Re-bind an in-flight instance row to the worker executing it.
    async fn assign_instance(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError>;

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Move `scheduled` rows whose `schedule_after` has passed back to
    /// `queued`. Returns the number of promoted rows.
    async fn promote_scheduled(&self, table: QueueTable) -> Result<u64, StoreError>;

    /// Requeue the in-progress work of workers whose last ping is older than
    /// `worker_timeout` and mark those workers cleaned up. Idempotent: the
    /// attempt counter of requeued actions is not touched, and a second pass
    /// finds nothing to do.
    async fn reclaim_timed_out_workers(
        &self,
        worker_timeout: Duration,
    ) -> Result<ReclaimReport, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_parse_roundtrip() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Scheduled,
            QueueStatus::InProgress,
            QueueStatus::Done,
        ] {
            assert_eq!(QueueStatus::parse(&status.to_string()).unwrap(), status);
        }
        assert!(matches!(
            QueueStatus::parse("bogus"),
            Err(StoreError::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_table_names() {
        assert_eq!(QueueTable::Instance.table_name(), "daemon_workflow_instance");
        assert_eq!(QueueTable::Action.table_name(), "daemon_action");
    }

    #[test]
    fn test_action_row_timeouts() {
        let row = ActionRow {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            workflow_name: "wf".into(),
            step_key: "s1".into(),
            registry_id: "r".into(),
            input_body: None,
            status: QueueStatus::Queued,
            retry_current_attempt: 0,
            retry_max_attempts: 3,
            retry_backoff_seconds: 0.5,
            retry_backoff_factor: 2.0,
            retry_jitter: 0.0,
            wall_soft_timeout: Some(Duration::from_secs(3)),
            wall_hard_timeout: None,
            cpu_soft_timeout: None,
            cpu_hard_timeout: Some(Duration::from_secs(9)),
            schedule_after: None,
            assigned_worker_status_id: None,
            final_result_id: None,
            launch_time: Utc::now(),
        };

        let timeouts = row.timeouts();
        assert_eq!(timeouts.len(), 2);
        assert_eq!(row.retry_policy().max_attempts, 3);
        assert_eq!(row.retry_policy().backoff_seconds, 0.5);
    }

    #[tokio::test]
    async fn test_with_db_retries_gives_up_on_permanent_errors() {
        let mut calls = 0;
        let result: Result<(), _> = with_db_retries("test", || {
            calls += 1;
            async { Err(StoreError::Serialization("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_db_retries_retries_transient_errors() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = with_db_retries("test", || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(StoreError::Database("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

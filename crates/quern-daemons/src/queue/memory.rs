//! In-memory implementation of QueueBackend for testing
//!
//! Provides the same semantics as the PostgreSQL implementation, including
//! ready/result notification streams, without needing a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::backend::*;

const BROADCAST_CAPACITY: usize = 1024;

/// In-memory implementation of QueueBackend
///
/// Primarily for tests: all state lives behind in-process locks, and the
/// notification streams are backed by broadcast channels instead of
/// LISTEN/NOTIFY.
pub struct InMemoryQueue {
    instances: RwLock<HashMap<Uuid, InstanceRow>>,
    actions: RwLock<HashMap<Uuid, ActionRow>>,
    results: RwLock<HashMap<Uuid, ActionResultRow>>,
    workers: RwLock<HashMap<i64, WorkerStatusRow>>,
    next_worker_id: RwLock<i64>,
    ready_tx: broadcast::Sender<(QueueTable, ReadyNotification)>,
    result_tx: broadcast::Sender<ResultNotification>,
}

impl InMemoryQueue {
    /// Create a new in-memory queue
    pub fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (result_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            instances: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            next_worker_id: RwLock::new(1),
            ready_tx,
            result_tx,
        }
    }

    /// Number of action rows (all statuses)
    pub fn action_count(&self) -> usize {
        self.actions.read().len()
    }

    /// Number of result rows
    pub fn result_count(&self) -> usize {
        self.results.read().len()
    }

    /// Result rows for one action, oldest first
    pub fn results_for_action(&self, action_id: Uuid) -> Vec<ActionResultRow> {
        let mut rows: Vec<_> = self
            .results
            .read()
            .values()
            .filter(|r| r.action_id == action_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Action rows for one instance, oldest first
    pub fn actions_for_instance(&self, instance_id: Uuid) -> Vec<ActionRow> {
        let mut rows: Vec<_> = self
            .actions
            .read()
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id);
        rows
    }

    /// Rewind a worker's last ping, as if it had stopped pinging `ago` ago.
    ///
    /// Test hook for exercising the reclaim path without waiting.
    pub fn backdate_worker_ping(&self, worker_status_id: i64, ago: Duration) {
        if let Some(worker) = self.workers.write().get_mut(&worker_status_id) {
            worker.last_ping = Utc::now() - chrono::Duration::from_std(ago).unwrap_or_default();
        }
    }

    /// Force a row's status, bypassing the normal lifecycle. Test hook.
    pub fn force_status(&self, table: QueueTable, id: Uuid, status: QueueStatus) {
        match table {
            QueueTable::Action => {
                if let Some(row) = self.actions.write().get_mut(&id) {
                    row.status = status;
                }
            }
            QueueTable::Instance => {
                if let Some(row) = self.instances.write().get_mut(&id) {
                    row.status = status;
                }
            }
        }
    }

    fn emit_ready(&self, table: QueueTable, notification: ReadyNotification) {
        // Send errors just mean nobody is listening yet
        let _ = self.ready_tx.send((table, notification));
    }

    fn queued_backlog(&self, table: QueueTable, queues: &[String]) -> Vec<ReadyNotification> {
        let filter = |name: &str| queues.is_empty() || queues.iter().any(|q| q == name);

        let mut backlog: Vec<(Uuid, ReadyNotification)> = match table {
            QueueTable::Instance => self
                .instances
                .read()
                .values()
                .filter(|row| row.status == QueueStatus::Queued && filter(&row.workflow_name))
                .map(|row| {
                    (
                        row.id,
                        ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        },
                    )
                })
                .collect(),
            QueueTable::Action => self
                .actions
                .read()
                .values()
                .filter(|row| row.status == QueueStatus::Queued && filter(&row.workflow_name))
                .map(|row| {
                    (
                        row.id,
                        ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        },
                    )
                })
                .collect(),
        };

        // UUIDv7 ids sort by creation time, matching the cursor scan order
        backlog.sort_by_key(|(id, _)| *id);
        backlog.into_iter().map(|(_, n)| n).collect()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue_instance(&self, row: NewInstance) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let status = match row.schedule_after {
            Some(at) if at > Utc::now() => QueueStatus::Scheduled,
            _ => QueueStatus::Queued,
        };

        let instance = InstanceRow {
            id,
            workflow_name: row.workflow_name,
            registry_id: row.registry_id,
            input_body: row.input_body,
            output_body: None,
            status,
            error: None,
            launch_time: Utc::now(),
            end_time: None,
            schedule_after: row.schedule_after,
            assigned_worker_status_id: None,
        };

        let notification = ReadyNotification {
            id,
            workflow_name: instance.workflow_name.clone(),
            status,
        };
        self.instances.write().insert(id, instance);

        if status == QueueStatus::Queued {
            self.emit_ready(QueueTable::Instance, notification);
        }
        Ok(id)
    }

    async fn enqueue_action(&self, row: NewAction) -> Result<Uuid, StoreError> {
        use crate::reliability::{TimeoutKind, TimeoutMeasure};

        let id = Uuid::now_v7();
        let status = match row.schedule_after {
            Some(at) if at > Utc::now() => QueueStatus::Scheduled,
            _ => QueueStatus::Queued,
        };

        let action = ActionRow {
            id,
            instance_id: row.instance_id,
            workflow_name: row.workflow_name.clone(),
            step_key: row.step_key.clone(),
            registry_id: row.registry_id.clone(),
            input_body: row.input_body.clone(),
            status,
            retry_current_attempt: 0,
            retry_max_attempts: row.retry.max_attempts.max(1) as i32,
            retry_backoff_seconds: row.retry.backoff_seconds,
            retry_backoff_factor: row.retry.backoff_factor,
            retry_jitter: row.retry.jitter_seconds,
            wall_soft_timeout: row.timeout_column(TimeoutMeasure::Wall, TimeoutKind::Soft),
            wall_hard_timeout: row.timeout_column(TimeoutMeasure::Wall, TimeoutKind::Hard),
            cpu_soft_timeout: row.timeout_column(TimeoutMeasure::Cpu, TimeoutKind::Soft),
            cpu_hard_timeout: row.timeout_column(TimeoutMeasure::Cpu, TimeoutKind::Hard),
            schedule_after: row.schedule_after,
            assigned_worker_status_id: None,
            final_result_id: None,
            launch_time: Utc::now(),
        };

        let notification = ReadyNotification {
            id,
            workflow_name: row.workflow_name,
            status,
        };
        self.actions.write().insert(id, action);

        if status == QueueStatus::Queued {
            self.emit_ready(QueueTable::Action, notification);
        }
        Ok(id)
    }

    async fn subscribe_ready(
        &self,
        table: QueueTable,
        queues: &[String],
    ) -> Result<mpsc::Receiver<ReadyNotification>, StoreError> {
        let (tx, rx) = mpsc::channel(64);

        // Subscribe before collecting the backlog so nothing is missed in
        // between; duplicates are harmless because claims are exclusive.
        let mut live = self.ready_tx.subscribe();
        let backlog = self.queued_backlog(table, queues);
        let queues = queues.to_vec();

        tokio::spawn(async move {
            for notification in backlog {
                if tx.send(notification).await.is_err() {
                    return;
                }
            }

            loop {
                match live.recv().await {
                    Ok((origin, notification)) => {
                        if origin != table {
                            continue;
                        }
                        if !queues.is_empty()
                            && !queues.iter().any(|q| *q == notification.workflow_name)
                        {
                            continue;
                        }
                        if tx.send(notification).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn subscribe_results(
        &self,
    ) -> Result<mpsc::Receiver<ResultNotification>, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let mut live = self.result_tx.subscribe();

        tokio::spawn(async move {
            loop {
                match live.recv().await {
                    Ok(notification) => {
                        if tx.send(notification).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn claim_exclusive(
        &self,
        table: QueueTable,
        id: Uuid,
        worker_status_id: i64,
    ) -> Result<bool, StoreError> {
        match table {
            QueueTable::Instance => {
                let mut instances = self.instances.write();
                match instances.get_mut(&id) {
                    Some(row) if row.status == QueueStatus::Queued => {
                        row.status = QueueStatus::InProgress;
                        row.assigned_worker_status_id = Some(worker_status_id);
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => Ok(false),
                }
            }
            QueueTable::Action => {
                let mut actions = self.actions.write();
                match actions.get_mut(&id) {
                    Some(row) if row.status == QueueStatus::Queued => {
                        row.status = QueueStatus::InProgress;
                        row.assigned_worker_status_id = Some(worker_status_id);
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => Ok(false),
                }
            }
        }
    }

    async fn fetch_instance(&self, id: Uuid) -> Result<InstanceRow, StoreError> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(id))
    }

    async fn fetch_action(&self, id: Uuid) -> Result<ActionRow, StoreError> {
        self.actions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ActionNotFound(id))
    }

    async fn fetch_result(&self, id: Uuid) -> Result<ActionResultRow, StoreError> {
        self.results
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ResultNotFound(id))
    }

    async fn find_action_by_step(
        &self,
        instance_id: Uuid,
        step_key: &str,
    ) -> Result<Option<ActionRow>, StoreError> {
        Ok(self
            .actions
            .read()
            .values()
            .find(|a| a.instance_id == instance_id && a.step_key == step_key)
            .cloned())
    }

    async fn append_result(
        &self,
        action_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<Uuid, StoreError> {
        let result_id = Uuid::now_v7();

        {
            let mut actions = self.actions.write();
            let action = actions
                .get_mut(&action_id)
                .ok_or(StoreError::ActionNotFound(action_id))?;

            if action.status == QueueStatus::Done {
                return Err(StoreError::AlreadyFinal(action_id));
            }

            let (result_body, exception, exception_stack) = match &outcome {
                ActionOutcome::Success { result_body } => {
                    (Some(result_body.clone()), None, None)
                }
                ActionOutcome::Failure {
                    exception,
                    exception_stack,
                } => (None, Some(exception.clone()), exception_stack.clone()),
            };

            self.results.write().insert(
                result_id,
                ActionResultRow {
                    id: result_id,
                    action_id,
                    result_body,
                    exception,
                    exception_stack,
                    created_at: Utc::now(),
                },
            );

            action.retry_current_attempt += 1;

            match &outcome {
                ActionOutcome::Success { .. } => {
                    action.status = QueueStatus::Done;
                    action.final_result_id = Some(result_id);
                }
                ActionOutcome::Failure { .. } => {
                    if action.retry_current_attempt < action.retry_max_attempts {
                        let delay = action
                            .retry_policy()
                            .delay_after_attempt(action.retry_current_attempt as u32);
                        action.status = QueueStatus::Scheduled;
                        action.schedule_after =
                            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                    } else {
                        action.status = QueueStatus::Done;
                        action.final_result_id = Some(result_id);
                    }
                }
            }
        }

        let _ = self.result_tx.send(ResultNotification {
            id: result_id,
            action_id,
        });
        Ok(result_id)
    }

    async fn complete_instance(
        &self,
        id: Uuid,
        output_body: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let row = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        row.status = QueueStatus::Done;
        row.output_body = Some(output_body);
        row.end_time = Some(Utc::now());
        Ok(())
    }

    async fn fail_instance(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let row = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        row.status = QueueStatus::Done;
        row.error = Some(error.to_string());
        row.end_time = Some(Utc::now());
        Ok(())
    }

    async fn register_worker(&self, worker: NewWorker) -> Result<i64, StoreError> {
        let mut next = self.next_worker_id.write();
        let id = *next;
        *next += 1;

        self.workers.write().insert(
            id,
            WorkerStatusRow {
                id,
                internal_process_id: worker.internal_process_id,
                is_action_worker: worker.is_action_worker,
                launch_time: Utc::now(),
                last_ping: Utc::now(),
                is_draining: false,
                cleaned_up: false,
            },
        );
        Ok(id)
    }

    async fn worker_ping(
        &self,
        worker_status_id: i64,
        is_draining: bool,
    ) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(&worker_status_id)
            .ok_or(StoreError::WorkerNotFound(worker_status_id))?;

        worker.last_ping = Utc::now();
        worker.is_draining = is_draining;
        Ok(())
    }

    async fn fetch_worker(&self, worker_status_id: i64) -> Result<WorkerStatusRow, StoreError> {
        self.workers
            .read()
            .get(&worker_status_id)
            .cloned()
            .ok_or(StoreError::WorkerNotFound(worker_status_id))
    }

    async fn assign_action(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError> {
        let mut actions = self.actions.write();
        let action = actions.get_mut(&id).ok_or(StoreError::ActionNotFound(id))?;
        action.assigned_worker_status_id = Some(worker_status_id);
        Ok(())
    }

    async fn assign_instance(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;
        instance.assigned_worker_status_id = Some(worker_status_id);
        Ok(())
    }

    async fn promote_scheduled(&self, table: QueueTable) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut promoted = Vec::new();

        match table {
            QueueTable::Instance => {
                let mut instances = self.instances.write();
                for row in instances.values_mut() {
                    if row.status == QueueStatus::Scheduled
                        && row.schedule_after.map(|at| at < now).unwrap_or(true)
                    {
                        row.status = QueueStatus::Queued;
                        promoted.push(ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        });
                    }
                }
            }
            QueueTable::Action => {
                let mut actions = self.actions.write();
                for row in actions.values_mut() {
                    if row.status == QueueStatus::Scheduled
                        && row.schedule_after.map(|at| at < now).unwrap_or(true)
                    {
                        row.status = QueueStatus::Queued;
                        promoted.push(ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        });
                    }
                }
            }
        }

        let count = promoted.len() as u64;
        for notification in promoted {
            self.emit_ready(table, notification);
        }
        Ok(count)
    }

    async fn reclaim_timed_out_workers(
        &self,
        worker_timeout: Duration,
    ) -> Result<ReclaimReport, StoreError> {
        let threshold =
            Utc::now() - chrono::Duration::from_std(worker_timeout).unwrap_or_default();

        let timed_out: Vec<i64> = {
            let workers = self.workers.read();
            workers
                .values()
                .filter(|w| w.last_ping < threshold && !w.cleaned_up)
                .map(|w| w.id)
                .collect()
        };

        if timed_out.is_empty() {
            return Ok(ReclaimReport::default());
        }

        let mut report = ReclaimReport {
            workers_cleaned: timed_out.len() as u64,
            ..Default::default()
        };
        let mut requeued = Vec::new();

        {
            let mut actions = self.actions.write();
            for row in actions.values_mut() {
                if row.status == QueueStatus::InProgress
                    && row
                        .assigned_worker_status_id
                        .map(|w| timed_out.contains(&w))
                        .unwrap_or(false)
                {
                    row.status = QueueStatus::Queued;
                    report.actions_requeued += 1;
                    requeued.push((
                        QueueTable::Action,
                        ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        },
                    ));
                }
            }
        }

        {
            let mut instances = self.instances.write();
            for row in instances.values_mut() {
                if row.status == QueueStatus::InProgress
                    && row
                        .assigned_worker_status_id
                        .map(|w| timed_out.contains(&w))
                        .unwrap_or(false)
                {
                    row.status = QueueStatus::Queued;
                    report.instances_requeued += 1;
                    requeued.push((
                        QueueTable::Instance,
                        ReadyNotification {
                            id: row.id,
                            workflow_name: row.workflow_name.clone(),
                            status: row.status,
                        },
                    ));
                }
            }
        }

        {
            let mut workers = self.workers.write();
            for id in &timed_out {
                if let Some(worker) = workers.get_mut(id) {
                    worker.cleaned_up = true;
                }
            }
        }

        for (table, notification) in requeued {
            self.emit_ready(table, notification);
        }
        Ok(report)
    }
}

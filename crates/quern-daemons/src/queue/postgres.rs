//! PostgreSQL implementation of QueueBackend
//!
//! Production persistence using PostgreSQL with:
//! - Exclusive row claiming via `FOR UPDATE NOWAIT`
//! - A two-phase ready stream: streaming catch-up scan, then LISTEN/NOTIFY
//! - Result appends and retry transitions in one transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::backend::*;

/// Channel carrying `{id, workflow_name, status, origin}` payloads for both
/// queue tables; `origin` is the emitting table name.
const READY_CHANNEL: &str = "instance_updates";

/// Channel carrying `{id, action_id}` payloads for appended result rows.
const RESULT_CHANNEL: &str = "result_updates";

/// PostgreSQL implementation of QueueBackend
///
/// Uses a connection pool for efficient database access; notification
/// streams take dedicated connections for the lifetime of each subscriber.
///
/// # Example
///
/// ```ignore
/// use quern_daemons::PostgresQueue;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let queue = PostgresQueue::new(pool);
/// queue.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
}

/// Migrations shipped with the crate (queue tables, indexes, result trigger).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

impl PostgresQueue {
    /// Create a new PostgreSQL queue with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the crate's migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_lock_unavailable(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "55P03")
        .unwrap_or(false)
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn status_for_schedule(schedule_after: Option<DateTime<Utc>>) -> QueueStatus {
    match schedule_after {
        Some(at) if at > Utc::now() => QueueStatus::Scheduled,
        _ => QueueStatus::Queued,
    }
}

fn opt_millis(d: Option<Duration>) -> Option<i64> {
    d.map(|d| d.as_millis() as i64)
}

fn millis_opt(ms: Option<i64>) -> Option<Duration> {
    ms.map(|ms| Duration::from_millis(ms.max(0) as u64))
}

fn instance_from_row(row: &PgRow) -> Result<InstanceRow, StoreError> {
    let status: String = row.get("status");
    Ok(InstanceRow {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        registry_id: row.get("registry_id"),
        input_body: row.get("input_body"),
        output_body: row.get("output_body"),
        status: QueueStatus::parse(&status)?,
        error: row.get("error"),
        launch_time: row.get("launch_time"),
        end_time: row.get("end_time"),
        schedule_after: row.get("schedule_after"),
        assigned_worker_status_id: row.get("assigned_worker_status_id"),
    })
}

fn action_from_row(row: &PgRow) -> Result<ActionRow, StoreError> {
    let status: String = row.get("status");
    Ok(ActionRow {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        workflow_name: row.get("workflow_name"),
        step_key: row.get("step_key"),
        registry_id: row.get("registry_id"),
        input_body: row.get("input_body"),
        status: QueueStatus::parse(&status)?,
        retry_current_attempt: row.get("retry_current_attempt"),
        retry_max_attempts: row.get("retry_max_attempts"),
        retry_backoff_seconds: row.get("retry_backoff_seconds"),
        retry_backoff_factor: row.get("retry_backoff_factor"),
        retry_jitter: row.get("retry_jitter"),
        wall_soft_timeout: millis_opt(row.get("wall_soft_timeout_ms")),
        wall_hard_timeout: millis_opt(row.get("wall_hard_timeout_ms")),
        cpu_soft_timeout: millis_opt(row.get("cpu_soft_timeout_ms")),
        cpu_hard_timeout: millis_opt(row.get("cpu_hard_timeout_ms")),
        schedule_after: row.get("schedule_after"),
        assigned_worker_status_id: row.get("assigned_worker_status_id"),
        final_result_id: row.get("final_result_id"),
        launch_time: row.get("launch_time"),
    })
}

/// Wire payload emitted by the ready trigger
#[derive(Debug, Deserialize)]
struct ReadyPayload {
    id: Uuid,
    workflow_name: String,
    status: QueueStatus,
    origin: String,
}

/// Short stable suffix derived from the declared queue list, so that two
/// deployments with different queue filters sharing one database install
/// distinct trigger functions instead of clobbering each other's.
fn queue_list_suffix(queues: &[String]) -> String {
    let mut hasher = Sha256::new();
    for queue in queues {
        hasher.update(queue.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

async fn install_ready_trigger(
    pool: &PgPool,
    table: QueueTable,
    queues: &[String],
) -> Result<(), StoreError> {
    let suffix = queue_list_suffix(queues);

    let queue_filter = if queues.is_empty() {
        "TRUE".to_string()
    } else {
        let names = queues
            .iter()
            .map(|q| format!("'{}'", q.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        format!("NEW.workflow_name IN ({names})")
    };

    let fn_name = format!("quern_notify_ready_{suffix}");
    let create_function = format!(
        r#"
        CREATE OR REPLACE FUNCTION {fn_name}()
        RETURNS TRIGGER AS $$
        BEGIN
            IF (NEW.status = 'queued' AND ({queue_filter})) THEN
                PERFORM pg_notify(
                    '{READY_CHANNEL}',
                    json_build_object(
                        'id', NEW.id,
                        'workflow_name', NEW.workflow_name,
                        'status', NEW.status,
                        'origin', TG_TABLE_NAME
                    )::text
                );
            END IF;
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql;
        "#
    );

    let trigger_name = format!("quern_ready_{suffix}_trigger");
    let table_name = table.table_name();
    let drop_trigger = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {table_name}");
    let create_trigger = format!(
        "CREATE TRIGGER {trigger_name} \
         AFTER INSERT OR UPDATE ON {table_name} \
         FOR EACH ROW EXECUTE FUNCTION {fn_name}()"
    );

    sqlx::query(&create_function)
        .execute(pool)
        .await
        .map_err(db_err)?;
    sqlx::query(&drop_trigger).execute(pool).await.map_err(db_err)?;
    sqlx::query(&create_trigger)
        .execute(pool)
        .await
        .map_err(db_err)?;

    debug!(table = table_name, trigger = %trigger_name, "installed ready trigger");
    Ok(())
}

/// Drive one ready subscription: catch-up scan, then LISTEN.
///
/// Exits when the receiver is dropped (send fails) or on a database error,
/// releasing the listener connection either way.
async fn pump_ready(
    pool: PgPool,
    table: QueueTable,
    queues: Vec<String>,
    tx: mpsc::Sender<ReadyNotification>,
) -> Result<(), StoreError> {
    // Phase A: stream the existing backlog of queued rows in insertion order
    let scan_sql = format!(
        "SELECT id, workflow_name, status FROM {} \
         WHERE status = 'queued' \
           AND (cardinality($1::text[]) = 0 OR workflow_name = ANY($1)) \
         ORDER BY id",
        table.table_name()
    );

    {
        let mut rows = sqlx::query(&scan_sql).bind(&queues).fetch(&pool);
        while let Some(row) = rows.try_next().await.map_err(db_err)? {
            let status: String = row.get("status");
            let notification = ReadyNotification {
                id: row.get("id"),
                workflow_name: row.get("workflow_name"),
                status: QueueStatus::parse(&status)?,
            };
            if tx.send(notification).await.is_err() {
                return Ok(());
            }
        }
    }

    // Phase B: install the notify trigger (idempotent) and block on LISTEN
    install_ready_trigger(&pool, table, &queues).await?;

    let mut listener = PgListener::connect_with(&pool).await.map_err(db_err)?;
    listener.listen(READY_CHANNEL).await.map_err(db_err)?;

    loop {
        let notification = listener.recv().await.map_err(db_err)?;
        let payload: ReadyPayload =
            serde_json::from_str(notification.payload()).map_err(ser_err)?;

        if payload.origin != table.table_name() {
            continue;
        }
        if !queues.is_empty() && !queues.contains(&payload.workflow_name) {
            continue;
        }

        let ready = ReadyNotification {
            id: payload.id,
            workflow_name: payload.workflow_name,
            status: payload.status,
        };
        if tx.send(ready).await.is_err() {
            return Ok(());
        }
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    #[instrument(skip(self, row), fields(workflow_name = %row.workflow_name))]
    async fn enqueue_instance(&self, row: NewInstance) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let status = status_for_schedule(row.schedule_after);

        sqlx::query(
            r#"
            INSERT INTO daemon_workflow_instance
                (id, workflow_name, registry_id, input_body, status, schedule_after)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&row.workflow_name)
        .bind(&row.registry_id)
        .bind(&row.input_body)
        .bind(status.to_string())
        .bind(row.schedule_after)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue instance: {}", e);
            db_err(e)
        })?;

        debug!(%id, "enqueued workflow instance");
        Ok(id)
    }

    #[instrument(skip(self, row), fields(step_key = %row.step_key))]
    async fn enqueue_action(&self, row: NewAction) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let status = status_for_schedule(row.schedule_after);

        use crate::reliability::{TimeoutKind, TimeoutMeasure};
        sqlx::query(
            r#"
            INSERT INTO daemon_action (
                id, instance_id, workflow_name, step_key, registry_id, input_body, status,
                retry_max_attempts, retry_backoff_seconds, retry_backoff_factor, retry_jitter,
                wall_soft_timeout_ms, wall_hard_timeout_ms, cpu_soft_timeout_ms, cpu_hard_timeout_ms,
                schedule_after
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(id)
        .bind(row.instance_id)
        .bind(&row.workflow_name)
        .bind(&row.step_key)
        .bind(&row.registry_id)
        .bind(&row.input_body)
        .bind(status.to_string())
        .bind(row.retry.max_attempts.max(1) as i32)
        .bind(row.retry.backoff_seconds)
        .bind(row.retry.backoff_factor)
        .bind(row.retry.jitter_seconds)
        .bind(opt_millis(row.timeout_column(TimeoutMeasure::Wall, TimeoutKind::Soft)))
        .bind(opt_millis(row.timeout_column(TimeoutMeasure::Wall, TimeoutKind::Hard)))
        .bind(opt_millis(row.timeout_column(TimeoutMeasure::Cpu, TimeoutKind::Soft)))
        .bind(opt_millis(row.timeout_column(TimeoutMeasure::Cpu, TimeoutKind::Hard)))
        .bind(row.schedule_after)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue action: {}", e);
            db_err(e)
        })?;

        debug!(%id, instance_id = %row.instance_id, "enqueued action");
        Ok(id)
    }

    async fn subscribe_ready(
        &self,
        table: QueueTable,
        queues: &[String],
    ) -> Result<mpsc::Receiver<ReadyNotification>, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let pool = self.pool.clone();
        let queues = queues.to_vec();

        tokio::spawn(async move {
            if let Err(e) = pump_ready(pool, table, queues, tx).await {
                error!(?table, "ready stream terminated: {}", e);
            }
        });

        Ok(rx)
    }

    async fn subscribe_results(
        &self,
    ) -> Result<mpsc::Receiver<ResultNotification>, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let run = async {
                let mut listener = PgListener::connect_with(&pool).await.map_err(db_err)?;
                listener.listen(RESULT_CHANNEL).await.map_err(db_err)?;

                loop {
                    let notification = listener.recv().await.map_err(db_err)?;
                    let payload: ResultNotification =
                        serde_json::from_str(notification.payload()).map_err(ser_err)?;
                    if tx.send(payload).await.is_err() {
                        return Ok::<(), StoreError>(());
                    }
                }
            };
            if let Err(e) = run.await {
                error!("result stream terminated: {}", e);
            }
        });

        Ok(rx)
    }

    #[instrument(skip(self))]
    async fn claim_exclusive(
        &self,
        table: QueueTable,
        id: Uuid,
        worker_status_id: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let lock_sql = format!(
            "SELECT id FROM {} WHERE id = $1 AND status = 'queued' FOR UPDATE NOWAIT",
            table.table_name()
        );
        let locked = sqlx::query(&lock_sql).bind(id).fetch_optional(&mut *tx).await;

        match locked {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Row no longer queued (claimed and updated by someone else)
                tx.rollback().await.map_err(db_err)?;
                return Ok(false);
            }
            Err(e) if is_lock_unavailable(&e) => {
                tx.rollback().await.map_err(db_err)?;
                debug!(%id, "lost claim race");
                return Ok(false);
            }
            Err(e) => return Err(db_err(e)),
        }

        let update_sql = format!(
            "UPDATE {} SET status = 'in_progress', assigned_worker_status_id = $2 WHERE id = $1",
            table.table_name()
        );
        sqlx::query(&update_sql)
            .bind(id)
            .bind(worker_status_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%id, worker_status_id, "claimed row");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn fetch_instance(&self, id: Uuid) -> Result<InstanceRow, StoreError> {
        let row = sqlx::query("SELECT * FROM daemon_workflow_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::InstanceNotFound(id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn fetch_action(&self, id: Uuid) -> Result<ActionRow, StoreError> {
        let row = sqlx::query("SELECT * FROM daemon_action WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ActionNotFound(id))?;

        action_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn fetch_result(&self, id: Uuid) -> Result<ActionResultRow, StoreError> {
        let row = sqlx::query("SELECT * FROM daemon_action_result WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ResultNotFound(id))?;

        Ok(ActionResultRow {
            id: row.get("id"),
            action_id: row.get("action_id"),
            result_body: row.get("result_body"),
            exception: row.get("exception"),
            exception_stack: row.get("exception_stack"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self))]
    async fn find_action_by_step(
        &self,
        instance_id: Uuid,
        step_key: &str,
    ) -> Result<Option<ActionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM daemon_action WHERE instance_id = $1 AND step_key = $2",
        )
        .bind(instance_id)
        .bind(step_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(action_from_row).transpose()
    }

    #[instrument(skip(self, outcome))]
    async fn append_result(
        &self,
        action_id: Uuid,
        outcome: ActionOutcome,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let action = sqlx::query(
            r#"
            SELECT status, retry_current_attempt, retry_max_attempts,
                   retry_backoff_seconds, retry_backoff_factor, retry_jitter
            FROM daemon_action WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(action_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ActionNotFound(action_id))?;

        let status: String = action.get("status");
        if QueueStatus::parse(&status)? == QueueStatus::Done {
            // A drained worker and a straggling thread can both report; keep
            // the first terminal outcome.
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::AlreadyFinal(action_id));
        }

        let result_id = Uuid::now_v7();
        let (result_body, exception, exception_stack) = match &outcome {
            ActionOutcome::Success { result_body } => (Some(result_body.clone()), None, None),
            ActionOutcome::Failure {
                exception,
                exception_stack,
            } => (None, Some(exception.clone()), exception_stack.clone()),
        };

        sqlx::query(
            r#"
            INSERT INTO daemon_action_result (id, action_id, result_body, exception, exception_stack)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(result_id)
        .bind(action_id)
        .bind(&result_body)
        .bind(&exception)
        .bind(&exception_stack)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let attempt: i32 = action.get("retry_current_attempt");
        let new_attempt = attempt + 1;

        match &outcome {
            ActionOutcome::Success { .. } => {
                sqlx::query(
                    r#"
                    UPDATE daemon_action
                    SET status = 'done', final_result_id = $2, retry_current_attempt = $3
                    WHERE id = $1
                    "#,
                )
                .bind(action_id)
                .bind(result_id)
                .bind(new_attempt)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            ActionOutcome::Failure { .. } => {
                let max_attempts: i32 = action.get("retry_max_attempts");

                if new_attempt < max_attempts {
                    let policy = crate::reliability::RetryPolicy {
                        max_attempts: max_attempts.max(1) as u32,
                        backoff_seconds: action.get("retry_backoff_seconds"),
                        backoff_factor: action.get("retry_backoff_factor"),
                        jitter_seconds: action.get("retry_jitter"),
                    };
                    let delay = policy.delay_after_attempt(new_attempt as u32);
                    let schedule_after =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

                    sqlx::query(
                        r#"
                        UPDATE daemon_action
                        SET status = 'scheduled', schedule_after = $2, retry_current_attempt = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(action_id)
                    .bind(schedule_after)
                    .bind(new_attempt)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                    debug!(%action_id, attempt = new_attempt, ?delay, "action will retry");
                } else {
                    sqlx::query(
                        r#"
                        UPDATE daemon_action
                        SET status = 'done', final_result_id = $2, retry_current_attempt = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(action_id)
                    .bind(result_id)
                    .bind(new_attempt)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                    debug!(%action_id, attempt = new_attempt, "action failed terminally");
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(result_id)
    }

    #[instrument(skip(self, output_body))]
    async fn complete_instance(
        &self,
        id: Uuid,
        output_body: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE daemon_workflow_instance
            SET status = 'done', output_body = $2, end_time = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&output_body)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(id));
        }

        debug!(%id, "completed workflow instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_instance(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE daemon_workflow_instance
            SET status = 'done', error = $2, end_time = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(id));
        }

        debug!(%id, "recorded terminal workflow error");
        Ok(())
    }

    #[instrument(skip(self, worker))]
    async fn register_worker(&self, worker: NewWorker) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO worker_status (internal_process_id, is_action_worker)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(worker.internal_process_id)
        .bind(worker.is_action_worker)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let id: i64 = row.get("id");
        debug!(worker_status_id = id, internal_process_id = %worker.internal_process_id, "registered worker");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn worker_ping(
        &self,
        worker_status_id: i64,
        is_draining: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE worker_status SET last_ping = now(), is_draining = $2 WHERE id = $1",
        )
        .bind(worker_status_id)
        .bind(is_draining)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_status_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_worker(&self, worker_status_id: i64) -> Result<WorkerStatusRow, StoreError> {
        let row = sqlx::query("SELECT * FROM worker_status WHERE id = $1")
            .bind(worker_status_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkerNotFound(worker_status_id))?;

        Ok(WorkerStatusRow {
            id: row.get("id"),
            internal_process_id: row.get("internal_process_id"),
            is_action_worker: row.get("is_action_worker"),
            launch_time: row.get("launch_time"),
            last_ping: row.get("last_ping"),
            is_draining: row.get("is_draining"),
            cleaned_up: row.get("cleaned_up"),
        })
    }

    #[instrument(skip(self))]
    async fn assign_action(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE daemon_action SET assigned_worker_status_id = $2 WHERE id = $1")
            .bind(id)
            .bind(worker_status_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn assign_instance(&self, id: Uuid, worker_status_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE daemon_workflow_instance SET assigned_worker_status_id = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(worker_status_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn promote_scheduled(&self, table: QueueTable) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'queued' \
             WHERE status = 'scheduled' AND schedule_after < now()",
            table.table_name()
        );

        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(db_err)?;

        let promoted = result.rows_affected();
        if promoted > 0 {
            debug!(?table, promoted, "promoted scheduled rows");
        }
        Ok(promoted)
    }

    #[instrument(skip(self))]
    async fn reclaim_timed_out_workers(
        &self,
        worker_timeout: Duration,
    ) -> Result<ReclaimReport, StoreError> {
        let threshold =
            Utc::now() - chrono::Duration::from_std(worker_timeout).unwrap_or_default();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT id FROM worker_status WHERE last_ping < $1 AND cleaned_up = FALSE",
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let worker_ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        if worker_ids.is_empty() {
            tx.rollback().await.map_err(db_err)?;
            return Ok(ReclaimReport::default());
        }

        // The attempt counter is deliberately untouched: a lost worker is
        // not the user code's fault.
        let actions = sqlx::query(
            r#"
            UPDATE daemon_action SET status = 'queued'
            WHERE status = 'in_progress' AND assigned_worker_status_id = ANY($1)
            "#,
        )
        .bind(&worker_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let instances = sqlx::query(
            r#"
            UPDATE daemon_workflow_instance SET status = 'queued'
            WHERE status = 'in_progress' AND assigned_worker_status_id = ANY($1)
            "#,
        )
        .bind(&worker_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE worker_status SET cleaned_up = TRUE WHERE id = ANY($1)")
            .bind(&worker_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let report = ReclaimReport {
            workers_cleaned: worker_ids.len() as u64,
            actions_requeued: actions.rows_affected(),
            instances_requeued: instances.rows_affected(),
        };
        debug!(?report, "reclaimed timed-out workers");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_list_suffix_is_stable() {
        let a = queue_list_suffix(&["orders".into(), "emails".into()]);
        let b = queue_list_suffix(&["orders".into(), "emails".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);

        let c = queue_list_suffix(&[]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_for_schedule() {
        assert_eq!(status_for_schedule(None), QueueStatus::Queued);
        assert_eq!(
            status_for_schedule(Some(Utc::now() - chrono::Duration::seconds(10))),
            QueueStatus::Queued
        );
        assert_eq!(
            status_for_schedule(Some(Utc::now() + chrono::Duration::seconds(10))),
            QueueStatus::Scheduled
        );
    }

    #[test]
    fn test_millis_conversions() {
        assert_eq!(opt_millis(Some(Duration::from_secs(2))), Some(2000));
        assert_eq!(opt_millis(None), None);
        assert_eq!(millis_opt(Some(1500)), Some(Duration::from_millis(1500)));
        assert_eq!(millis_opt(None), None);
    }

    // Postgres-backed behavior is covered by tests/postgres_queue_test.rs,
    // which requires DATABASE_URL and is #[ignore]d by default.
}

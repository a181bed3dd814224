//! Worker units supervised by the daemon runner
//!
//! This module provides:
//! - [`ActionWorker`] - a thread pool executing actions under CPU/wall
//!   deadlines, with drain semantics on hard timeouts
//! - [`InstanceWorker`] - a cooperative scheduler driving many workflow
//!   instances concurrently
//! - [`WorkerHandle`] - the supervision handle held by the runner
//!
//! Workers pull from bounded channels fed by the runner's dispatch loops.
//! The channels are not durable and do not need to be: anything dropped
//! mid-flight is re-queued from the database by the reclaim loop.

mod action;
mod cputime;
mod instance;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

pub use action::{leaked_task_threads, ActionWorker, ActionWorkerConfig, TaskDefinition};
pub use cputime::ThreadCpuClock;
pub use instance::{InstanceTaskDefinition, InstanceWorker, InstanceWorkerConfig};

/// A bounded task channel shared by several pulling workers
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Wrap a receiver for sharing across workers
pub fn shared_receiver<T>(rx: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(rx))
}

/// Errors surfaced by worker run loops
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] crate::queue::StoreError),
}

/// Supervision handle for a spawned worker
///
/// The runner uses this to observe liveness and draining, to request a
/// drain, and to reap the worker once it exits.
pub struct WorkerHandle {
    process_id: uuid::Uuid,
    join: tokio::task::JoinHandle<()>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    drain_rx: tokio::sync::watch::Receiver<bool>,
}

impl WorkerHandle {
    pub(crate) fn new(
        process_id: uuid::Uuid,
        join: tokio::task::JoinHandle<()>,
        shutdown_tx: tokio::sync::watch::Sender<bool>,
        drain_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            process_id,
            join,
            shutdown_tx,
            drain_rx,
        }
    }

    /// Stable identifier of the worker unit
    pub fn process_id(&self) -> uuid::Uuid {
        self.process_id
    }

    /// Whether the worker's run loop is still executing.
    ///
    /// This tracks the supervised unit, not its task threads: a thread
    /// stuck past a hard deadline outlives the unit and is accounted on
    /// [`leaked_task_threads`] instead.
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Whether the worker has signalled that it is draining
    pub fn is_draining(&self) -> bool {
        *self.drain_rx.borrow()
    }

    /// Ask the worker to drain and exit
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Forcibly stop the worker's run loop
    pub fn abort(&self) {
        self.join.abort();
    }
}

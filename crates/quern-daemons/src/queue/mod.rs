//! Queue backend over the relational store
//!
//! This module provides:
//! - [`QueueBackend`] trait for the durable work queue
//! - [`PostgresQueue`] for production (LISTEN/NOTIFY, row locks, migrations)
//! - [`InMemoryQueue`] for testing

mod backend;
mod memory;
mod postgres;

pub use backend::{
    with_db_retries, ActionOutcome, ActionResultRow, ActionRow, InstanceRow, NewAction,
    NewInstance, NewWorker, QueueBackend, QueueStatus, QueueTable, ReadyNotification,
    ReclaimReport, ResultNotification, StoreError, WorkerStatusRow,
};
pub use memory::InMemoryQueue;
pub use postgres::PostgresQueue;

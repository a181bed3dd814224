//! Reliability primitives
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter for failed actions
//! - [`TimeoutDefinition`] - Wall-clock and CPU-time deadlines, soft or hard

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{first_exceeded, min_soft_limit, TimeoutDefinition, TimeoutKind, TimeoutMeasure};

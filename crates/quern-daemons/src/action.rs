//! Action abstractions
//!
//! Actions are the retryable units of work executed by action workers. They
//! receive a typed input, may fail and be re-queued according to their retry
//! policy, and run under wall-clock and CPU-time deadlines.

use serde::{Deserialize, Serialize};

use crate::reliability::{RetryPolicy, TimeoutDefinition};

/// Error type for action failures
///
/// The message lands in the result row's `exception` column; the optional
/// stack in `exception_stack`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionError {
    /// Error message
    pub message: String,

    /// Captured failure context (error chain, backtrace text)
    pub stack: Option<String>,
}

impl ActionError {
    /// Create a new action error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach failure context
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

/// Options for one `run_action` call
///
/// Carries the retry policy and the timeout set persisted onto the action
/// row when it is enqueued.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionOptions {
    /// Retry policy for this action
    pub retry: RetryPolicy,

    /// Deadlines enforced by the executing worker
    pub timeouts: Vec<TimeoutDefinition>,
}

impl ActionOptions {
    /// Create options with the default (no-retry) policy and no deadlines
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Add a timeout definition
    pub fn with_timeout(mut self, timeout: TimeoutDefinition) -> Self {
        self.timeouts.push(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_action_error_display() {
        let error = ActionError::new("boom");
        assert_eq!(error.to_string(), "boom");
        assert!(error.stack.is_none());
    }

    #[test]
    fn test_action_error_from_anyhow() {
        let error: ActionError = anyhow::anyhow!("lower level failure").into();
        assert_eq!(error.message, "lower level failure");
        assert!(error.stack.is_some());
    }

    #[test]
    fn test_options_builder() {
        let options = ActionOptions::new()
            .with_retry(RetryPolicy::exponential())
            .with_timeout(TimeoutDefinition::wall_soft(Duration::from_secs(3)))
            .with_timeout(TimeoutDefinition::cpu_hard(Duration::from_secs(9)));

        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.timeouts.len(), 2);
    }
}

//! Task timeout definitions
//!
//! A task may carry any combination of wall-clock and CPU-time deadlines,
//! each either soft (cooperatively cancellable) or hard (fatal to the worker).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How elapsed time is measured for a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMeasure {
    /// Monotonic wall-clock time since the task started
    Wall,

    /// CPU time consumed by the task's OS thread
    Cpu,
}

/// What happens when a timeout is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Advisory deadline: the task is cancelled cooperatively at its next
    /// suspension point
    Soft,

    /// Fatal deadline: the whole worker drains, since a saturated thread
    /// cannot be interrupted any other way
    Hard,
}

/// A single timeout constraint on a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutDefinition {
    pub measure: TimeoutMeasure,
    pub kind: TimeoutKind,

    #[serde(with = "duration_millis")]
    pub limit: Duration,
}

impl TimeoutDefinition {
    pub fn wall_soft(limit: Duration) -> Self {
        Self {
            measure: TimeoutMeasure::Wall,
            kind: TimeoutKind::Soft,
            limit,
        }
    }

    pub fn wall_hard(limit: Duration) -> Self {
        Self {
            measure: TimeoutMeasure::Wall,
            kind: TimeoutKind::Hard,
            limit,
        }
    }

    pub fn cpu_soft(limit: Duration) -> Self {
        Self {
            measure: TimeoutMeasure::Cpu,
            kind: TimeoutKind::Soft,
            limit,
        }
    }

    pub fn cpu_hard(limit: Duration) -> Self {
        Self {
            measure: TimeoutMeasure::Cpu,
            kind: TimeoutKind::Hard,
            limit,
        }
    }

    /// Check whether the timeout has been crossed given the task's elapsed
    /// wall and CPU time. CPU time may be unavailable on some platforms, in
    /// which case CPU timeouts never fire.
    pub fn is_exceeded(&self, wall_elapsed: Duration, cpu_elapsed: Option<Duration>) -> bool {
        match self.measure {
            TimeoutMeasure::Wall => wall_elapsed > self.limit,
            TimeoutMeasure::Cpu => cpu_elapsed.map(|cpu| cpu > self.limit).unwrap_or(false),
        }
    }
}

/// Find the first crossed timeout, hard deadlines first.
///
/// Hard violations take priority so that the worker drains even when a soft
/// deadline was crossed in the same tick.
pub fn first_exceeded(
    timeouts: &[TimeoutDefinition],
    wall_elapsed: Duration,
    cpu_elapsed: Option<Duration>,
) -> Option<TimeoutKind> {
    for kind in [TimeoutKind::Hard, TimeoutKind::Soft] {
        if timeouts
            .iter()
            .filter(|t| t.kind == kind)
            .any(|t| t.is_exceeded(wall_elapsed, cpu_elapsed))
        {
            return Some(kind);
        }
    }
    None
}

/// Smallest soft limit among the definitions, if any.
///
/// Task threads sleep until this point before they start polling for a
/// cancellation flag.
pub fn min_soft_limit(timeouts: &[TimeoutDefinition]) -> Option<Duration> {
    timeouts
        .iter()
        .filter(|t| t.kind == TimeoutKind::Soft)
        .map(|t| t.limit)
        .min()
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_exceeded() {
        let t = TimeoutDefinition::wall_soft(Duration::from_secs(3));
        assert!(!t.is_exceeded(Duration::from_secs(2), None));
        assert!(t.is_exceeded(Duration::from_secs(4), None));
    }

    #[test]
    fn test_cpu_requires_measurement() {
        let t = TimeoutDefinition::cpu_hard(Duration::from_secs(1));
        assert!(!t.is_exceeded(Duration::from_secs(10), None));
        assert!(t.is_exceeded(Duration::from_secs(10), Some(Duration::from_secs(2))));
    }

    #[test]
    fn test_hard_takes_priority() {
        let timeouts = vec![
            TimeoutDefinition::wall_soft(Duration::from_secs(1)),
            TimeoutDefinition::wall_hard(Duration::from_secs(2)),
        ];

        // Only the soft deadline has passed
        assert_eq!(
            first_exceeded(&timeouts, Duration::from_millis(1500), None),
            Some(TimeoutKind::Soft)
        );

        // Both have passed: hard wins
        assert_eq!(
            first_exceeded(&timeouts, Duration::from_secs(3), None),
            Some(TimeoutKind::Hard)
        );
    }

    #[test]
    fn test_none_exceeded() {
        let timeouts = vec![TimeoutDefinition::cpu_soft(Duration::from_secs(5))];
        assert_eq!(first_exceeded(&timeouts, Duration::from_secs(60), None), None);
    }

    #[test]
    fn test_min_soft_limit() {
        let timeouts = vec![
            TimeoutDefinition::wall_soft(Duration::from_secs(3)),
            TimeoutDefinition::cpu_soft(Duration::from_secs(1)),
            TimeoutDefinition::wall_hard(Duration::from_millis(100)),
        ];
        assert_eq!(min_soft_limit(&timeouts), Some(Duration::from_secs(1)));
        assert_eq!(min_soft_limit(&[]), None);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let t = TimeoutDefinition::cpu_soft(Duration::from_millis(1500));
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("1500"));

        let parsed: TimeoutDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(t, parsed);
    }
}

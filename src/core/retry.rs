//! How often a failing primary is called again before its fallback runs.
//!
//! Only fixed delays are supported; the run deadline bounds the total wait.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::task::TaskError;

/// Retry settings attached to a task.
///
/// `max_attempts` counts retries only, so `fixed(2, ..)` calls the primary
/// at most three times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Pause between a failed call and the next one. Serialized in milliseconds.
    #[serde(rename = "delay_ms", with = "millis")]
    pub delay: Duration,

    pub retry_on: RetryCondition,
}

/// Which errors are worth another call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Any error except cancellation.
    #[default]
    Always,

    /// Errors for which [`TaskError::is_transient`] holds.
    TransientOnly,

    Never,
}

impl RetryPolicy {
    /// A single call, never repeated.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO).with_condition(RetryCondition::Never)
    }

    /// Up to `max_attempts` retries, `delay` apart, on any error.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            retry_on: RetryCondition::default(),
        }
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Whether a failure could ever lead to a second call.
    pub fn is_enabled(&self) -> bool {
        !matches!(self.retry_on, RetryCondition::Never) && self.max_attempts != 0
    }

    /// Upper bound on calls of the primary, the first one included.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// `attempts` is the number of calls made so far, the failed one included.
    pub fn should_retry(&self, attempts: u32, error: &TaskError) -> bool {
        let retryable = match self.retry_on {
            RetryCondition::Always => !matches!(error, TaskError::Cancelled),
            RetryCondition::TransientOnly => error.is_transient(),
            RetryCondition::Never => false,
        };
        retryable && attempts < self.total_attempts()
    }

    pub fn get_delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

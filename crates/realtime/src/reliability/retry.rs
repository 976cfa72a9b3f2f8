//! Backoff policy shared by reconnects and event redelivery

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff configuration
///
/// The same shape drives two schedules:
/// - connection recovery (`RetryPolicy::reconnect()`), where `max_attempts`
///   counts reconnect attempts
/// - event redelivery (`RetryPolicy::redelivery()`), where `max_attempts`
///   counts applies including the first one
///
/// # Example
///
/// ```
/// use everruns_realtime::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::reconnect();
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for_retry(7), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 doubles each time)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::redelivery()
    }
}

impl RetryPolicy {
    /// Reconnect schedule: 1s doubling up to 60s, 10 attempts, no jitter
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    /// Redelivery schedule for failed applies: 3 attempts, 500ms doubling up to 10s
    pub fn redelivery() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given retry (1-based)
    ///
    /// `min(initial * coefficient^(retry - 1), max_interval)`, then jittered.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another attempt may follow `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
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

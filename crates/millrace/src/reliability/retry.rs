//! Retry policy for action execution

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy applied between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `delay = clamp(factor^attempt, min, max)`
    #[default]
    Exponential,
    /// `delay = max(factor * attempt, min)`
    Linear,
}

/// Configuration for action retries.
///
/// Stored on every activity row, so a policy change mid-flight keeps the
/// already-recorded policy for that activity.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use millrace::reliability::RetryPolicy;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_backoff_min(Duration::from_secs(1))
///     .with_backoff_max(Duration::from_secs(60));
///
/// // retry 1 after ~2s, retry 2 after ~4s, retry 3 after ~8s, ...
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; 0 disables retrying.
    pub max_retries: u32,

    pub backoff_strategy: BackoffStrategy,

    /// Growth base (exponential) or per-attempt increment in seconds
    /// (linear).
    pub backoff_factor: f64,

    #[serde(with = "duration_millis")]
    pub backoff_min: Duration,

    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,

    /// Fractional multiplicative jitter in `[0, 1]`; 0.5 means the delay
    /// varies by up to 50% in either direction.
    pub backoff_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 3 retries, 2x growth,
    /// 1s..60s clamp, 50% jitter.
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_factor: 2.0,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.5,
        }
    }

    /// Linear backoff: `factor * attempt` seconds, floored at `min`.
    pub fn linear(factor: f64) -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_factor: factor,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.0,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::exponential()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_backoff_min(mut self, min: Duration) -> Self {
        self.backoff_min = min;
        self
    }

    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another retry is allowed after `retry_count` failures.
    pub fn has_retries_remaining(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry_count` (1-based), without jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let seconds = match self.backoff_strategy {
            BackoffStrategy::Exponential => self
                .backoff_factor
                .powi(retry_count as i32)
                .min(self.backoff_max.as_secs_f64())
                .max(self.backoff_min.as_secs_f64()),
            BackoffStrategy::Linear => (self.backoff_factor * retry_count as f64)
                .max(self.backoff_min.as_secs_f64()),
        };
        Duration::from_secs_f64(seconds)
    }

    /// Delay before retry number `retry_count`, with jitter applied.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base = self.base_delay(retry_count).as_secs_f64();
        if self.backoff_jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let mut rng = rand::thread_rng();
        let spread = base * self.backoff_jitter;
        let jittered = (base + rng.gen_range(-spread..=spread)).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
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
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[test]
    fn test_exponential_growth_and_clamp() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        // Clamped at backoff_max
        assert_eq!(policy.base_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_floor() {
        let policy = RetryPolicy::exponential()
            .with_backoff_factor(0.5)
            .with_jitter(0.0);
        // 0.5^1 = 0.5s, floored at backoff_min of 1s
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_growth() {
        let policy = RetryPolicy::linear(3.0).with_jitter(0.0);
        assert_eq!(policy.base_delay(1), Duration::from_secs(3));
        assert_eq!(policy.base_delay(2), Duration::from_secs(6));
        // Linear is floored at min but not capped at max
        assert_eq!(policy.base_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        let base = policy.base_delay(2).as_secs_f64();
        for _ in 0..100 {
            let d = policy.delay_for_retry(2).as_secs_f64();
            assert!(d >= base * 0.5 - f64::EPSILON);
            assert!(d <= base * 1.5 + f64::EPSILON);
        }
    }

    #[test]
    fn test_retries_remaining() {
        let policy = RetryPolicy::exponential().with_max_retries(2);
        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(1));
        assert!(!policy.has_retries_remaining(2));
        assert!(!RetryPolicy::no_retry().has_retries_remaining(0));
    }

    #[test]
    fn test_serialization_round_trip() {
        let policy = RetryPolicy::linear(1.5).with_max_retries(7);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}

//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for adapter commands.
///
/// Exponential backoff with optional jitter, saturating at `max_delay`:
/// `delay = min(base_delay * multiplier^(attempts - 1) * (1 ± jitter), max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of a single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Relative random spread in `[0.0, 1.0]`; `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 4,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: 1,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next retry.
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    /// With base_delay=2s, multiplier=2.0 and no jitter:
    /// attempt 1: 2s, attempt 2: 4s, attempt 3: 8s.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_secs = self.base_delay.as_secs_f64();
        let mut delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-jitter..=jitter);
            delay_secs *= 1.0 + factor;
        }
        if delay_secs.is_nan() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(delay_secs.clamp(0.0, self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(base: Duration) -> RetryPolicy {
        RetryPolicy {
            base_delay: base,
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = exact(Duration::from_secs(2));

        // attempt 1: 2s, attempt 2: 4s, attempt 3: 8s
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..exact(Duration::from_secs(4))
        };
        for _ in 0..100 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_secs(2), "{delay:?}");
            assert!(delay <= Duration::from_secs(6), "{delay:?}");
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = exact(Duration::from_millis(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn huge_backoff_saturates_at_max_delay() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"base_delay": 500, "multiplier": 1e300, "max_attempts": 50, "max_delay": 2000, "jitter": 0}"#,
        )
        .unwrap();
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(3), Duration::from_secs(2));
        assert_eq!(policy.next_delay(50), Duration::from_secs(2));

        let nan = RetryPolicy {
            multiplier: f64::NAN,
            ..exact(Duration::from_secs(1))
        };
        assert_eq!(nan.next_delay(2), nan.max_delay);
        assert_eq!(RetryPolicy::no_retry().next_delay(7), Duration::ZERO);
    }

    #[test]
    fn deserializes_millis_and_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"base_delay": 250}"#).unwrap();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, RetryPolicy::default().max_attempts);
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }
}

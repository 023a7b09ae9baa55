//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for failed tasks.
///
/// Exponential backoff with a floor (`base_delay`), a cap (`max_delay`) and a
/// randomized jitter factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay for the first retry, and the floor for every retry.
    pub base_delay: Duration,

    /// Upper bound for any retry delay.
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Fraction of the nominal delay that may be shaved off at random (0.0..=1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 1s, 2s, 4s, 8s, 10s: five retries reach the cap.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failures` (1-indexed), without jitter.
    ///
    /// delay = min(max_delay, base_delay * multiplier^(failures - 1))
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exp = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exp);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Jittered delay, `sample` in `[0, 1)`.
    pub fn delay_with(&self, failures: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(failures).as_secs_f64();
        let factor = 1.0 - self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        let secs = (nominal * factor)
            .max(self.base_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn next_delay(&self, failures: u32) -> Duration {
        let sample: f64 = rand::thread_rng().r#gen();
        self.delay_with(failures, sample)
    }

    /// Same as [`next_delay`](Self::next_delay), as a chrono duration for timestamp math.
    pub fn next_delay_chrono(&self, failures: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.next_delay(failures)).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(4, 8000)]
    #[case(5, 10000)]
    #[case(40, 10000)]
    fn nominal_backoff_is_exponential_and_capped(#[case] failures: u32, #[case] millis: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(failures), Duration::from_millis(millis));
    }

    #[test]
    fn nominal_backoff_is_non_decreasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=12).map(|n| policy.nominal_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_floor_and_cap() {
        let policy = RetryPolicy::default();
        for n in 1..=8 {
            for sample in [0.0, 0.25, 0.5, 0.99] {
                let d = policy.delay_with(n, sample);
                assert!(d >= policy.base_delay);
                assert!(d <= policy.max_delay);
                assert!(d <= policy.nominal_delay(n));
            }
            let random = policy.next_delay(n);
            assert!(random >= policy.base_delay && random <= policy.max_delay);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_with(3, 0.9), Duration::from_secs(4));
    }
}

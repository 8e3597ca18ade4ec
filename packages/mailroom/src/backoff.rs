//! Retry backoff policy.
//!
//! The dispatcher asks the policy for a delay when abandoning a failed item;
//! the delay becomes the item's `due_on`. The only contract is
//! attempt → non-negative duration.

use std::time::Duration;

/// Maps an attempt number (1-based: the attempt about to be scheduled) to a
/// re-delivery delay.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with a cap and uniform jitter.
///
/// `delay(n) = min(cap, base << min(n, max_exponent)) + uniform(0, jitter)`.
/// Defaults: 250 ms base doubling to a 60 s cap, exponent clamped at 10,
/// up to 250 ms of jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_exponent: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
            max_exponent: 10,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let exponential = self
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.cap)
            .min(self.cap);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        exponential + jitter
    }
}

/// No delay at all. Useful in tests and for queues where immediate retry is
/// acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// The same delay for every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds_for_every_attempt() {
        let policy = ExponentialBackoff::default();
        for attempt in 0..=16u32 {
            let floor_ms = 250u64 << attempt.min(10);
            let floor = Duration::from_millis(floor_ms).min(Duration::from_secs(60));
            let ceiling = floor + Duration::from_millis(250);
            for _ in 0..100 {
                let delay = policy.delay(attempt);
                assert!(
                    delay >= floor && delay <= ceiling,
                    "attempt {attempt}: {delay:?} outside [{floor:?}, {ceiling:?}]"
                );
            }
        }
    }

    #[test]
    fn test_cap_applies_before_jitter() {
        let policy = ExponentialBackoff::default();
        // 2^10 * 250ms = 256s, well past the 60s cap.
        for _ in 0..100 {
            let delay = policy.delay(30);
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(60) + Duration::from_millis(250));
        }
    }

    #[test]
    fn test_expected_early_delays() {
        // With jitter stripped: 500ms, 1s, 2s for attempts 1..=3.
        let policy = ExponentialBackoff {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn test_fixed_and_no_backoff() {
        assert_eq!(NoBackoff.delay(7), Duration::ZERO);
        assert_eq!(
            FixedBackoff(Duration::from_secs(5)).delay(1),
            Duration::from_secs(5)
        );
    }
}

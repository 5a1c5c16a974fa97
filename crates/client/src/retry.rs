use std::time::Duration;

use rand::Rng;

/// Bounded retry with exponential backoff for transport failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per part, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), with ±25%
    /// jitter so parallel parts do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn exponential_backoff_within_jitter() {
        let policy = RetryPolicy::default();
        for (attempt, base) in [(1u32, 0.2f64), (2, 0.4), (3, 0.8), (4, 1.6)] {
            let secs = policy.delay_for_attempt(attempt).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "attempt {attempt}: {secs:.3}s"
            );
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        let secs = policy.delay_for_attempt(30).as_secs_f64();
        assert!(secs <= 5.0 * 1.26, "{secs}");
        assert!(secs >= 5.0 * 0.74, "{secs}");
    }

    #[test]
    fn jitter_spreads_simultaneous_retries() {
        let policy = RetryPolicy::default();
        let delays: std::collections::HashSet<Duration> =
            (0..16).map(|_| policy.delay_for_attempt(2)).collect();
        assert!(delays.len() > 1, "{delays:?}");
    }

    #[test]
    fn zero_delay_policy() {
        let policy = RetryPolicy {
            initial_delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
    }
}

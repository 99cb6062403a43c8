//! Reconnection backoff
//!
//! `delay(n) = min(ceiling, base * 2^(n - 1))` for attempt `n >= 1`. The
//! attempt counter is incremented before the delay is computed, so the first
//! retry waits exactly `base`. No jitter: the schedule is deterministic.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential reconnect schedule with a ceiling
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// Create a schedule
    #[must_use]
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Schedule configured for a connection
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.reconnect_base_delay, config.backoff_ceiling)
    }

    /// Delay before reconnect attempt `attempt` (1-indexed; 0 is treated as 1)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);

        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_first_retry_uses_base() {
        let backoff = Backoff::new(ms(1000), ms(30_000));
        assert_eq!(backoff.delay_for_attempt(1), ms(1000));
        assert_eq!(backoff.delay_for_attempt(0), ms(1000));
    }

    #[test]
    fn test_doubling_until_ceiling() {
        let backoff = Backoff::new(ms(1000), ms(30_000));
        let delays: Vec<_> = (1..=7).map(|n| backoff.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![ms(1000), ms(2000), ms(4000), ms(8000), ms(16_000), ms(30_000), ms(30_000)]
        );
    }

    #[test]
    fn test_schedule_is_monotonic_and_bounded() {
        let backoff = Backoff::new(ms(150), ms(10_000));
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = backoff.delay_for_attempt(attempt);
            let expected = ms(150)
                .checked_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
                .unwrap_or(Duration::MAX)
                .min(ms(10_000));
            assert_eq!(delay, expected, "attempt {attempt}");
            assert!(delay >= previous);
            assert!(delay <= ms(10_000));
            previous = delay;
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(ms(1), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_from_config() {
        let config = ConnectionConfig::default();
        let backoff = Backoff::from_config(&config);
        assert_eq!(backoff.delay_for_attempt(1), config.reconnect_base_delay);
    }
}

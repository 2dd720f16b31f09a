use rand::Rng;
use std::time::Duration;

use crate::config::GatewayConfig;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter: 0.0 }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`, then reduced by up to `jitter` of itself.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.max);
        if self.jitter == 0.0 {
            return raw;
        }
        let keep = 1.0 - self.jitter * rand::thread_rng().gen::<f64>();
        raw.mul_f64(keep)
    }

    /// A server-specified wait takes precedence over the computed delay.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (1..=5).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(10)).with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d <= Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_retry_after_wins() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(9))), Duration::from_secs(9));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }
}

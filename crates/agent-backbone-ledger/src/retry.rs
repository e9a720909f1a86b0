//! Backoff schedule shared by step retries and transient storage retries.

use std::time::Duration;

use agent_backbone_domain::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-indexed): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    #[must_use]
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_grow_then_cap() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(2), Duration::from_secs(1));
        assert_eq!(policy.next_delay(3), Duration::from_secs(2));
        assert_eq!(policy.next_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.next_delay(0), policy.base_delay);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    proptest! {
        #[test]
        fn prop_delays_never_shrink_and_respect_the_cap(
            base in 0_u64..5_000,
            extra in 0_u64..60_000,
            multiplier in 1_u32..8,
            attempt in 1_u32..64,
        ) {
            let policy = RetryPolicy::from(&RetryConfig {
                max_attempts: 5,
                base_delay_ms: base,
                multiplier,
                max_delay_ms: base + extra,
            });
            let current = policy.next_delay(attempt);
            prop_assert!(current <= policy.max_delay);
            prop_assert!(policy.next_delay(attempt + 1) >= current);
        }
    }
}

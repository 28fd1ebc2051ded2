//! Exponential reconnect backoff shared by both transports.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy: attempt `k` (1-based) waits `min(base * 2^(k-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries allowed after the first failure; 0 means give up immediately.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt`, in milliseconds.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Whether retry number `attempt` is within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt >= 1 && attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delays_double_then_cap() {
        let policy = ReconnectPolicy {
            enabled: true,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 10,
        };
        let delays: Vec<u64> = (1..=6).map(|k| policy.delay_ms(k)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!ReconnectPolicy::disabled().should_retry(1));
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(base in 1u64..10_000, max in 1u64..600_000, k in 1u32..80) {
            let policy = ReconnectPolicy { enabled: true, base_delay_ms: base, max_delay_ms: max, max_attempts: 100 };
            let exact = (base as u128) << (k - 1).min(63);
            let expected = exact.min(max as u128) as u64;
            prop_assert_eq!(policy.delay_ms(k), expected);
        }
    }
}

//! Reconnection backoff for the event stream.

use std::time::Duration;

use crate::config::Config;
use crate::constants;

/// Capped exponential backoff with random jitter.
///
/// `delay(n) = min(max, base * 2^n + jitter)`; the cap holds with jitter
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt.
    pub base: Duration,
    /// Ceiling for every delay.
    pub max: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: constants::RECONNECT_BASE_DELAY,
            max: constants::RECONNECT_MAX_DELAY,
            jitter: constants::RECONNECT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Builds the policy from configuration, keeping the default jitter.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
            ..Self::default()
        }
    }

    /// Policy without jitter, for deterministic delays.
    #[must_use]
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before reconnection attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let exponential = self.base.saturating_mul(factor);

        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % jitter_ms.saturating_add(1))
        };

        exponential.saturating_add(jitter).min(self.max)
    }
}

//! Exponential backoff with full jitter.
//!
//! Shared by the radio link supervisor and the MQTT event loop so both
//! reconnect on the same schedule.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnection backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay ceiling of the first attempt in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    /// Upper bound of any delay in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_max_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

/// Backoff state for one reconnecting resource.
///
/// Each delay is drawn uniformly from `[0, min(max, base * 2^attempt)]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff starting at attempt zero.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let ceiling = self
            .config
            .base_ms
            .saturating_mul(factor)
            .min(self.config.max_ms);
        Duration::from_millis(ceiling)
    }

    /// Draw the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let mut ceilings = Vec::new();
        for _ in 0..8 {
            ceilings.push(backoff.ceiling().as_secs());
            backoff.next_delay();
        }
        assert_eq!(ceilings, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_delay_never_exceeds_ceiling() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_ms: 10,
            max_ms: 100,
        });
        for _ in 0..200 {
            let ceiling = backoff.ceiling();
            assert!(backoff.next_delay() <= ceiling);
        }
    }

    #[test]
    fn test_large_attempt_count_saturates() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }
}

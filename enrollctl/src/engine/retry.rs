use std::time::Duration;

use crate::config::ReservationConfig;

/// Exponential backoff for optimistic-update conflicts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl From<&ReservationConfig> for RetryPolicy {
    fn from(config: &ReservationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th conflict (0-based): backoff * factor^attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        exponential.min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

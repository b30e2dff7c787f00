use std::time::Duration;

use backoff::backoff::Backoff;

use super::config::ReconnectConfig;

/// Capped exponential reconnect policy.
///
/// Attempt `k` (1-based) waits `min(base * 2^(k - 1), max)`. Once `max_attempts` consecutive
/// attempts have been handed out, [`Backoff::next_backoff`] returns `None` until
/// [`Backoff::reset`] is called after a successful open.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_interval,
            max: config.max_interval,
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Number of attempts handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the given 1-based attempt number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);

        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl From<&ReconnectConfig> for ReconnectBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(config)
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}

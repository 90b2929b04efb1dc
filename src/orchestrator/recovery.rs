//! Recovery backoff policy.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::RecoveryConfig;

/// Decides how long a crashed session waits before its next recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Failed recoveries tolerated before switching to `cooldown`.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub base_backoff: Duration,
    /// Upper bound of the exponential delay.
    pub max_backoff: Duration,
    /// Wait once the retry budget is exhausted.
    pub cooldown: Duration,
}

impl From<&RecoveryConfig> for RecoveryPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_seconds),
            cooldown: Duration::from_secs(config.cooldown_seconds),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl RecoveryPolicy {
    /// Delay before the next attempt after `retry_count` failed recoveries.
    ///
    /// `retry_count == 0` (a failed first launch) waits `base_backoff`.
    /// Afterwards the delay doubles per failure up to `max_backoff`, and
    /// becomes `cooldown` once `retry_count >= max_retries`.
    #[must_use]
    pub fn delay_after(&self, retry_count: u32) -> Duration {
        if retry_count >= self.max_retries {
            return self.cooldown;
        }
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }

    /// Whether `retry_count` failures have used up the fast-retry budget.
    #[must_use]
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Earliest instant of the next attempt, counted from `now`.
    #[must_use]
    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        TimeDelta::from_std(self.delay_after(retry_count))
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

//! Reconnect delay schedule

use std::time::Duration;

use crate::config::ChatSettings;

/// Exponential backoff: `base`, doubling per attempt, capped at `max`, for at
/// most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ChatSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.reconnect_base_ms),
            max: Duration::from_millis(settings.reconnect_max_ms),
            max_attempts: settings.reconnect_max_attempts,
        }
    }

    /// Delay before 1-based `attempt`, or `None` once attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ChatSettings::default())
    }
}

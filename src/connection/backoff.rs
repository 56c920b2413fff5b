// src/connection/backoff.rs
use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::config::ReconnectSettings;

/// Reconnect delay schedule.
///
/// Delays double per attempt up to the cap. The manager arms at most one
/// deadline from this schedule at a time; `disconnect()` and
/// `reconnect_now()` clear it.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    schedule: ExponentialBackoff,
    max_attempts: u32,
}

impl BackoffScheduler {
    pub fn new(settings: &ReconnectSettings) -> Self {
        let schedule = ExponentialBackoff {
            initial_interval: Duration::from_millis(settings.base_delay_ms),
            max_interval: Duration::from_millis(settings.max_delay_ms),
            multiplier: 2.0,
            // Bounded by attempt count, not elapsed time.
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        Self {
            schedule,
            max_attempts: settings.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once `attempts` consecutive failures have used up the limit.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay ahead of the next attempt: `min(base * 2^attempt, max)`,
    /// zero-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.schedule
            .initial_interval
            .mul_f64(self.schedule.multiplier.powi(attempt as i32))
            .min(self.schedule.max_interval)
    }
}

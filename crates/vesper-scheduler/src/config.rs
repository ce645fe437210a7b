//! Scheduler configuration.

use std::time::Duration;

use crate::SchedulerError;
use crate::types::DEFAULT_MAX_ATTEMPTS;

/// Default lease held on a claimed job (5 minutes).
const DEFAULT_LEASE_SECS: u64 = 300;

/// Default fixed delay before a failed job is retried (5 minutes).
const DEFAULT_RETRY_DELAY_SECS: u64 = 300;

/// Default upper bound on the continuous loop's sleep between ticks.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Longest duration accepted for any setting (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Tunables for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long a claim excludes other workers.
    pub lease_duration: Duration,
    /// Delay applied to `schedule_at` after a retryable failure.
    pub retry_delay: Duration,
    /// Maximum sleep between ticks in continuous mode.
    pub poll_interval: Duration,
    /// `max_attempts` given to jobs scheduled without an explicit limit.
    pub default_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SchedulerConfig {
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.default_max_attempts == 0 {
            return Err(SchedulerError::InvalidConfig(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("lease_duration", self.lease_duration),
            ("retry_delay", self.retry_delay),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
            if value.as_secs() > MAX_DURATION_SECS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be at most {MAX_DURATION_SECS} seconds"
                )));
            }
        }

        Ok(())
    }

    /// Retry delay as a calendar duration.
    pub(crate) fn retry_delay_chrono(&self) -> chrono::Duration {
        to_chrono(self.retry_delay)
    }
}

/// Convert a std duration, saturating at [`MAX_DURATION_SECS`].
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let capped = duration.min(Duration::from_secs(MAX_DURATION_SECS));
    chrono::Duration::from_std(capped)
        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_DURATION_SECS as i64))
}

//! Bounded exponential backoff between publish attempts of one record

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Growth factor per further failure
    pub multiplier: u32,
    /// Cap on any single delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Retry on every poll; for tests and drills
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1,
            max: Duration::ZERO,
        }
    }

    /// Delay before the next attempt once `retry_count` attempts have failed
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(retry_count - 1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64));
        now + delay
    }
}

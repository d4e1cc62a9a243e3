use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::OutboxStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxHealthStatus {
    Healthy,
    /// Poison events present, or the oldest pending event is older than allowed
    Degraded,
}

/// Outbox section of a service health response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxHealth {
    pub status: OutboxHealthStatus,
    pub backlog: u64,
    pub poison: u64,
    pub total_retries: u64,
    pub oldest_unpublished_age_seconds: Option<i64>,
}

impl OutboxHealth {
    pub fn from_stats(stats: &OutboxStats, now: DateTime<Utc>, max_lag: Duration) -> Self {
        let age = stats
            .oldest_unpublished_age(now)
            .map(|age| age.num_seconds().max(0));

        let lagging = age.is_some_and(|secs| secs as u64 > max_lag.as_secs());
        let status = if stats.poison > 0 || lagging {
            OutboxHealthStatus::Degraded
        } else {
            OutboxHealthStatus::Healthy
        };

        Self {
            status,
            backlog: stats.backlog,
            poison: stats.poison,
            total_retries: stats.total_retries,
            oldest_unpublished_age_seconds: age,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == OutboxHealthStatus::Healthy
    }
}

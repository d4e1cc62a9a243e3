use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::BackoffPolicy;

/// Relay tuning, parsed from environment variables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    /// How long published records are kept before cleanup deletes them
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            backoff: BackoffPolicy::default(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let poll_interval = Duration::from_millis(parse_or(
            "OUTBOX_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?);
        let batch_size: usize = parse_or("OUTBOX_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err("OUTBOX_BATCH_SIZE must be at least 1".to_string());
        }
        if poll_interval.is_zero() {
            return Err("OUTBOX_POLL_INTERVAL_MS must be at least 1".to_string());
        }

        let backoff = BackoffPolicy {
            initial: Duration::from_millis(parse_or(
                "OUTBOX_BACKOFF_INITIAL_MS",
                defaults.backoff.initial.as_millis() as u64,
            )?),
            multiplier: parse_or("OUTBOX_BACKOFF_MULTIPLIER", defaults.backoff.multiplier)?,
            max: Duration::from_millis(parse_or(
                "OUTBOX_BACKOFF_MAX_MS",
                defaults.backoff.max.as_millis() as u64,
            )?),
        };

        let retention_hours: u64 =
            parse_or("OUTBOX_RETENTION_HOURS", defaults.retention.as_secs() / 3600)?;
        let retention = retention_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("OUTBOX_RETENTION_HOURS is too large: {retention_hours}"))?;
        let cleanup_interval = Duration::from_secs(parse_or(
            "OUTBOX_CLEANUP_INTERVAL_SECS",
            defaults.cleanup_interval.as_secs(),
        )?);

        Ok(RelayConfig {
            poll_interval,
            batch_size,
            backoff,
            retention,
            cleanup_interval,
        })
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

use idempotency::IdempotencyConfig;
use outbox::{RelayConfig, DEFAULT_MAX_RETRIES};
use std::env;
use std::time::Duration;

pub const SERVICE_NAME: &str = "order-service";

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// `inmemory` or `postgres`
    pub store_type: String,
    pub database_url: Option<String>,
    /// `inmemory` or `nats`
    pub bus_type: String,
    pub nats_url: String,
    /// Publish through JetStream so the broker drops redelivered message ids
    pub nats_jetstream: bool,
    pub host: String,
    pub port: u16,
    pub relay: RelayConfig,
    pub max_retries: u32,
    pub idempotency: IdempotencyConfig,
    pub key_cleanup_interval: Duration,
    /// Health turns degraded when the oldest pending event is older than this
    pub outbox_max_lag: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let store_type = env::var("STORE_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase();

        let database_url = env::var("DATABASE_URL").ok();
        if store_type == "postgres" && database_url.is_none() {
            return Err("DATABASE_URL must be set when STORE_TYPE=postgres".to_string());
        }
        if store_type != "postgres" && store_type != "inmemory" {
            return Err(format!(
                "Invalid STORE_TYPE: {store_type}. Must be 'inmemory' or 'postgres'"
            ));
        }

        let bus_type = env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase();

        let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let nats_jetstream = matches!(
            env::var("NATS_JETSTREAM").as_deref().map(str::to_lowercase).as_deref(),
            Ok("1" | "true" | "yes")
        );

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8094".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let max_retries: u32 = match env::var("OUTBOX_MAX_RETRIES") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| "OUTBOX_MAX_RETRIES must be a non-negative integer".to_string())?,
            Err(_) => DEFAULT_MAX_RETRIES,
        };

        let key_cleanup_interval = Duration::from_secs(
            env::var("IDEMPOTENCY_CLEANUP_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| "IDEMPOTENCY_CLEANUP_INTERVAL_SECS must be an integer".to_string())?,
        );

        let outbox_max_lag = Duration::from_secs(
            env::var("OUTBOX_MAX_LAG_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| "OUTBOX_MAX_LAG_SECS must be an integer".to_string())?,
        );

        Ok(Config {
            store_type,
            database_url,
            bus_type,
            nats_url,
            nats_jetstream,
            host,
            port,
            relay: RelayConfig::from_env()?,
            max_retries,
            idempotency: IdempotencyConfig::from_env(SERVICE_NAME)?,
            key_cleanup_interval,
            outbox_max_lag,
        })
    }
}

use std::env;
use std::time::Duration;

use crate::LockPolicy;

/// Gate settings for one service
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Scopes keys so services never collide on the same token
    pub service_name: String,
    /// Reject mutating requests that carry no key
    pub require_key: bool,
    /// Gate only POST/PUT/PATCH/DELETE
    pub only_mutating: bool,
    pub max_key_length: usize,
    pub lock_timeout: Duration,
    pub retention_period: Duration,
    /// Larger responses are executed but not cached
    pub max_response_size: usize,
    /// Larger request bodies are rejected before fingerprinting
    pub max_request_size: usize,
    /// Header naming the caller; when set, a key replays only for the same user
    pub user_header: Option<String>,
}

impl IdempotencyConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            require_key: false,
            only_mutating: true,
            max_key_length: 255,
            lock_timeout: Duration::from_secs(5 * 60),
            retention_period: Duration::from_secs(24 * 60 * 60),
            max_response_size: 1024 * 1024,
            max_request_size: 2 * 1024 * 1024,
            user_header: None,
        }
    }

    pub fn require_key(mut self, required: bool) -> Self {
        self.require_key = required;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    pub fn with_user_header(mut self, header: impl Into<String>) -> Self {
        self.user_header = Some(header.into().to_ascii_lowercase());
        self
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            lock_timeout: self.lock_timeout,
            retention: self.retention_period,
        }
    }

    /// Read `IDEMPOTENCY_*` overrides on top of the defaults for `service_name`
    pub fn from_env(service_name: impl Into<String>) -> Result<Self, String> {
        let mut config = Self::new(service_name);

        if let Ok(name) = env::var("IDEMPOTENCY_SERVICE_NAME") {
            if !name.trim().is_empty() {
                config.service_name = name.trim().to_string();
            }
        }
        if let Some(v) = read_bool("IDEMPOTENCY_REQUIRE_KEY")? {
            config.require_key = v;
        }
        if let Some(v) = read_bool("IDEMPOTENCY_ONLY_MUTATING")? {
            config.only_mutating = v;
        }
        if let Some(v) = read_u64("IDEMPOTENCY_MAX_KEY_LENGTH")? {
            config.max_key_length = v as usize;
        }
        if let Some(v) = read_u64("IDEMPOTENCY_LOCK_TIMEOUT_SECS")? {
            config.lock_timeout = Duration::from_secs(v);
        }
        if let Some(v) = read_u64("IDEMPOTENCY_RETENTION_HOURS")? {
            let secs = v
                .checked_mul(3600)
                .ok_or_else(|| format!("IDEMPOTENCY_RETENTION_HOURS is too large: {v}"))?;
            config.retention_period = Duration::from_secs(secs);
        }
        if let Some(v) = read_u64("IDEMPOTENCY_MAX_RESPONSE_BYTES")? {
            config.max_response_size = v as usize;
        }
        if let Some(v) = read_u64("IDEMPOTENCY_MAX_REQUEST_BYTES")? {
            config.max_request_size = v as usize;
        }
        if let Ok(header) = env::var("IDEMPOTENCY_USER_HEADER") {
            let header = header.trim();
            if !header.is_empty() {
                if axum::http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                    return Err(format!("IDEMPOTENCY_USER_HEADER is not a header name: {header:?}"));
                }
                config.user_header = Some(header.to_ascii_lowercase());
            }
        }

        if config.max_key_length == 0 {
            return Err("IDEMPOTENCY_MAX_KEY_LENGTH must be at least 1".to_string());
        }
        if config.lock_timeout.is_zero() {
            return Err("IDEMPOTENCY_LOCK_TIMEOUT_SECS must be at least 1".to_string());
        }

        Ok(config)
    }
}

fn read_bool(name: &str) -> Result<Option<bool>, String> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(format!("{name} must be true or false, got {raw:?}")),
        },
        Err(_) => Ok(None),
    }
}

fn read_u64(name: &str) -> Result<Option<u64>, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(None),
    }
}

//! Typed environment configuration, loaded once at startup.
//!
//! Grounded on `examples/ticketing/src/config.rs`'s `Config::from_env()`
//! pattern: every setting has a documented default, required settings fail
//! fast with a descriptive error instead of panicking deep in a handler.

use std::time::Duration;

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub kafka_brokers: String,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub platform_fee_percent: u8,
    pub psp_secret_key: String,
    pub psp_webhook_secret: String,
    pub rating_sweep_interval: Duration,
    pub request_expiry_sweep_interval: Duration,
}

/// Error returned when a required environment variable is missing or malformed.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(String);

impl Config {
    /// Loads configuration from the process environment (`.env` is loaded
    /// first, if present, via `dotenvy`, without overriding real env vars).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a numeric
    /// variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            port: parse_env("PORT", 8080)?,
            database_url: require_env("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok(),
            kafka_brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            jwt_secret: require_env("JWT_SECRET")?,
            jwt_refresh_secret: require_env("JWT_REFRESH_SECRET")?,
            access_ttl: Duration::from_secs(parse_env("ACCESS_TTL_SECS", 15 * 60)?),
            refresh_ttl: Duration::from_secs(parse_env("REFRESH_TTL_SECS", 7 * 24 * 60 * 60)?),
            platform_fee_percent: parse_env("PLATFORM_FEE_PERCENT", 10)?,
            psp_secret_key: require_env("PSP_SECRET_KEY")?,
            psp_webhook_secret: require_env("PSP_WEBHOOK_SECRET")?,
            rating_sweep_interval: Duration::from_secs(300),
            request_expiry_sweep_interval: Duration::from_secs(60),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError(format!("missing required env var {key}")))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("invalid value for {key}"))),
        Err(_) => Ok(default),
    }
}

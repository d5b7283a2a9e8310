//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub log_level: Level,
    pub catalog_base_url: String,
    /// Applied to every outbound HTTP call and to database connection acquisition.
    pub http_timeout: Duration,
    /// Between 1 and `MAX_SESSION_TTL_DAYS`.
    pub session_ttl_days: i64,
    pub sign_in_path: String,
    /// How long a guarded request waits for a restoring session before answering 503.
    pub session_resolve_wait: Duration,
    /// How often a signed-in context asks the backend whether its token is still valid.
    pub session_revalidate_interval: Duration,
    /// Contexts unused for this long are dropped from memory.
    pub context_idle_timeout: Duration,
    /// How long a favorites listing waits for an in-flight load.
    pub favorites_load_wait: Duration,
    pub cors_origin: String,
}

/// Upper bound for `SESSION_TTL_DAYS`, ten years.
pub const MAX_SESSION_TTL_DAYS: i64 = 3650;

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server and Database Settings ---
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", 5)?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Catalog Settings ---
        let catalog_base_url = lookup("CATALOG_BASE_URL")
            .unwrap_or_else(|| "https://openlibrary.org".to_string())
            .trim_end_matches('/')
            .to_string();
        let http_timeout = Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECS", 10)?);

        // --- Session Settings ---
        let session_ttl_days = parse_or(&lookup, "SESSION_TTL_DAYS", 30)?;
        if !(1..=MAX_SESSION_TTL_DAYS).contains(&session_ttl_days) {
            return Err(ConfigError::InvalidValue(
                "SESSION_TTL_DAYS".to_string(),
                format!("must be between 1 and {}", MAX_SESSION_TTL_DAYS),
            ));
        }
        let sign_in_path = lookup("SIGN_IN_PATH").unwrap_or_else(|| "/login".to_string());
        let session_resolve_wait =
            Duration::from_millis(parse_or(&lookup, "SESSION_RESOLVE_WAIT_MS", 1500)?);
        let session_revalidate_interval =
            Duration::from_secs(parse_or(&lookup, "SESSION_REVALIDATE_SECS", 60)?);
        let context_idle_timeout = Duration::from_secs(parse_or(&lookup, "CONTEXT_IDLE_SECS", 1800)?);
        let favorites_load_wait =
            Duration::from_millis(parse_or(&lookup, "FAVORITES_LOAD_WAIT_MS", 3000)?);
        let cors_origin =
            lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            bind_address,
            database_url,
            db_max_connections,
            log_level,
            catalog_base_url,
            http_timeout,
            session_ttl_days,
            sign_in_path,
            session_resolve_wait,
            session_revalidate_interval,
            context_idle_timeout,
            favorites_load_wait,
            cors_origin,
        })
    }
}

/// Parses `key` if it is set, otherwise falls back to `default`.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

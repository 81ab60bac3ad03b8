//! Server configuration read from the environment

use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:wirefleet.db?mode=rwc";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_SERVER_NAME: &str = "wirefleet";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    /// Reported in every status document
    pub server_name: String,
    pub status_cache_ttl: Duration,
    /// Deadline applied to every store call
    pub store_timeout: Duration,
    pub cache_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            status_cache_ttl: Duration::from_secs(60),
            store_timeout: Duration::from_secs(10),
            cache_sweep_interval: Duration::from_secs(60),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                tracing::warn!("{} has invalid value {:?}, using {:?}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            server_name: std::env::var("SERVER_NAME").unwrap_or(defaults.server_name),
            status_cache_ttl: env_secs("STATUS_CACHE_TTL_SECS", defaults.status_cache_ttl),
            store_timeout: env_secs("STORE_TIMEOUT_SECS", defaults.store_timeout),
            cache_sweep_interval: env_secs(
                "CACHE_SWEEP_INTERVAL_SECS",
                defaults.cache_sweep_interval,
            ),
        }
    }
}

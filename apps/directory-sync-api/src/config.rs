//! Application configuration loaded from environment variables.
//!
//! Required variables must be present and valid or startup fails with a
//! clear message.

use std::env;
use std::net::SocketAddr;
use thiserror::Error;
use xavyo_directory_sync::DirectorySyncConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_LOG_FILTER: &str = "info,xavyo_directory_sync=debug";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error(transparent)]
    Sync(#[from] xavyo_directory_sync::ConfigError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub rust_log: String,
    pub db_max_connections: u32,
    pub scheduler_enabled: bool,
    pub sync: DirectorySyncConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|name| env::var(name).ok())?;
        config.sync = DirectorySyncConfig::from_env()?;
        Ok(config)
    }

    /// Build from a variable lookup. Pipeline tunables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url =
            get("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".into()))?;

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e| invalid("BIND_ADDR", e))?;

        let db_max_connections = match get("DB_MAX_CONNECTIONS") {
            Some(v) => v.trim().parse().map_err(|e| invalid("DB_MAX_CONNECTIONS", e))?,
            None => DEFAULT_DB_MAX_CONNECTIONS,
        };
        if db_max_connections == 0 {
            return Err(invalid("DB_MAX_CONNECTIONS", "must be at least 1"));
        }

        let scheduler_enabled = match get("SCHEDULER_ENABLED") {
            Some(v) => parse_bool(&v).ok_or_else(|| invalid("SCHEDULER_ENABLED", "expected true or false"))?,
            None => true,
        };

        Ok(Self {
            database_url,
            bind_addr,
            rust_log: get("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            db_max_connections,
            scheduler_enabled,
            sync: DirectorySyncConfig::default(),
        })
    }
}

fn invalid(var: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/sync")])).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.db_max_connections, 10);
        assert!(config.scheduler_enabled);
        assert_eq!(config.rust_log, "info,xavyo_directory_sync=debug");
    }

    #[test]
    fn test_database_url_is_required() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "DATABASE_URL"));
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/sync"),
            ("BIND_ADDR", "localhost"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "BIND_ADDR"));

        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/sync"),
            ("SCHEDULER_ENABLED", "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "SCHEDULER_ENABLED"));
    }

    #[test]
    fn test_scheduler_can_be_disabled() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/sync"),
            ("SCHEDULER_ENABLED", "false"),
            ("DB_MAX_CONNECTIONS", "4"),
        ]))
        .unwrap();
        assert!(!config.scheduler_enabled);
        assert_eq!(config.db_max_connections, 4);
    }
}

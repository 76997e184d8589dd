//! Directory sync configuration.
//!
//! Every value has a default; `from_env` overrides them from
//! `DIRECTORY_SYNC_*` variables and fails fast on anything unparsable.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be used.
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Tunables for the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySyncConfig {
    /// How long a preview (and its approval) stays actionable.
    #[serde(default = "default_preview_ttl_days")]
    pub preview_ttl_days: i64,
    /// Default adapter fetch timeout; sources may override it.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Row errors kept per run.
    #[serde(default = "default_max_row_errors")]
    pub max_row_errors: usize,
    /// Item errors kept per apply.
    #[serde(default = "default_max_apply_errors")]
    pub max_apply_errors: usize,
    #[serde(default = "default_list_limit")]
    pub default_list_limit: usize,
    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: usize,
    /// Age after which an unfinished apply claim may be re-taken.
    #[serde(default = "default_apply_claim_ttl_secs")]
    pub apply_claim_ttl_secs: i64,
    /// Interval between scheduler ticks.
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Slack past the fetch timeout before an unfinished run counts as abandoned.
    #[serde(default = "default_run_stale_grace_secs")]
    pub run_stale_grace_secs: i64,
    /// Directory `csv` sources may read files from. `None` disables `path`.
    #[serde(default)]
    pub csv_root_dir: Option<String>,
    /// Hosts `http_json` sources may fetch from. Empty allows any public host.
    #[serde(default)]
    pub http_allowed_hosts: Vec<String>,
    /// Let `http_json` sources reach loopback and private addresses.
    #[serde(default)]
    pub http_allow_private_networks: bool,
}

fn default_preview_ttl_days() -> i64 {
    14
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_max_row_errors() -> usize {
    500
}

fn default_max_apply_errors() -> usize {
    500
}

fn default_list_limit() -> usize {
    50
}

fn default_max_list_limit() -> usize {
    200
}

fn default_apply_claim_ttl_secs() -> i64 {
    900
}

fn default_scheduler_tick_secs() -> u64 {
    60
}

fn default_run_stale_grace_secs() -> i64 {
    300
}

impl Default for DirectorySyncConfig {
    fn default() -> Self {
        Self {
            preview_ttl_days: default_preview_ttl_days(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_row_errors: default_max_row_errors(),
            max_apply_errors: default_max_apply_errors(),
            default_list_limit: default_list_limit(),
            max_list_limit: default_max_list_limit(),
            apply_claim_ttl_secs: default_apply_claim_ttl_secs(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            run_stale_grace_secs: default_run_stale_grace_secs(),
            csv_root_dir: None,
            http_allowed_hosts: Vec::new(),
            http_allow_private_networks: false,
        }
    }
}

impl DirectorySyncConfig {
    /// Load configuration from `DIRECTORY_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            preview_ttl_days: env_or("DIRECTORY_SYNC_PREVIEW_TTL_DAYS", defaults.preview_ttl_days)?,
            fetch_timeout_secs: env_or(
                "DIRECTORY_SYNC_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout_secs,
            )?,
            max_row_errors: env_or("DIRECTORY_SYNC_MAX_ROW_ERRORS", defaults.max_row_errors)?,
            max_apply_errors: env_or(
                "DIRECTORY_SYNC_MAX_APPLY_ERRORS",
                defaults.max_apply_errors,
            )?,
            default_list_limit: env_or(
                "DIRECTORY_SYNC_DEFAULT_LIST_LIMIT",
                defaults.default_list_limit,
            )?,
            max_list_limit: env_or("DIRECTORY_SYNC_MAX_LIST_LIMIT", defaults.max_list_limit)?,
            apply_claim_ttl_secs: env_or(
                "DIRECTORY_SYNC_APPLY_CLAIM_TTL_SECS",
                defaults.apply_claim_ttl_secs,
            )?,
            scheduler_tick_secs: env_or(
                "DIRECTORY_SYNC_SCHEDULER_TICK_SECS",
                defaults.scheduler_tick_secs,
            )?,
            run_stale_grace_secs: env_or(
                "DIRECTORY_SYNC_RUN_STALE_GRACE_SECS",
                defaults.run_stale_grace_secs,
            )?,
            csv_root_dir: env_opt("DIRECTORY_SYNC_CSV_ROOT_DIR"),
            http_allowed_hosts: env_opt("DIRECTORY_SYNC_HTTP_ALLOWED_HOSTS")
                .map(|raw| parse_host_list(&raw))
                .unwrap_or_default(),
            http_allow_private_networks: env_or(
                "DIRECTORY_SYNC_HTTP_ALLOW_PRIVATE_NETWORKS",
                defaults.http_allow_private_networks,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety property.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preview_ttl_days <= 0 {
            return Err(invalid("DIRECTORY_SYNC_PREVIEW_TTL_DAYS", "must be positive"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(invalid("DIRECTORY_SYNC_FETCH_TIMEOUT_SECS", "must be positive"));
        }
        if self.apply_claim_ttl_secs <= 0 {
            return Err(invalid("DIRECTORY_SYNC_APPLY_CLAIM_TTL_SECS", "must be positive"));
        }
        if self.run_stale_grace_secs <= 0 {
            return Err(invalid("DIRECTORY_SYNC_RUN_STALE_GRACE_SECS", "must be positive"));
        }
        if self.scheduler_tick_secs == 0 {
            return Err(invalid("DIRECTORY_SYNC_SCHEDULER_TICK_SECS", "must be positive"));
        }
        if self.max_list_limit == 0 {
            return Err(invalid("DIRECTORY_SYNC_MAX_LIST_LIMIT", "must be positive"));
        }
        if self.default_list_limit == 0 || self.default_list_limit > self.max_list_limit {
            return Err(invalid(
                "DIRECTORY_SYNC_DEFAULT_LIST_LIMIT",
                "must be between 1 and the max list limit",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn preview_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.preview_ttl_days)
    }

    #[must_use]
    pub fn apply_claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.apply_claim_ttl_secs)
    }

    /// How often a running apply refreshes its claim: a third of the TTL.
    #[must_use]
    pub fn apply_claim_renew_every(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.apply_claim_ttl_secs / 3).max(1))
    }

    /// Fetch timeout for a source, honoring its override.
    #[must_use]
    pub fn fetch_timeout(&self, source_override_secs: Option<u64>) -> std::time::Duration {
        let secs = source_override_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(self.fetch_timeout_secs);
        std::time::Duration::from_secs(secs)
    }

    /// Age after which a queued or running run is treated as abandoned.
    #[must_use]
    pub fn run_stale_after(&self, source_override_secs: Option<u64>) -> chrono::Duration {
        let fetch = i64::try_from(self.fetch_timeout(source_override_secs).as_secs())
            .unwrap_or(i64::MAX / 2);
        chrono::Duration::seconds(fetch.saturating_add(self.run_stale_grace_secs))
    }

    /// Apply the default and clamp into `[1, max_list_limit]`.
    #[must_use]
    pub fn clamp_list_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_list_limit)
            .clamp(1, self.max_list_limit)
    }
}

fn invalid(var: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.to_string(),
    }
}

fn env_opt(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

/// Comma-separated host names, lowercased.
fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|host| host.trim().to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect()
}

fn env_or<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    var: var.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

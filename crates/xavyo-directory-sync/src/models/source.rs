//! Directory sources: configured feeds bound to a school/district scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::types::{RecordType, Scope};

/// Cron schedule for automatic runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchedule {
    /// Five-field cron expression (`minute hour day-of-month month day-of-week`).
    pub cron: String,
    /// `UTC`, a fixed offset such as `+02:00`, or an IANA zone such as
    /// `America/Chicago`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Whether scheduled runs propose deactivations.
    #[serde(default)]
    pub deactivate_missing: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A configured upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySource {
    pub id: Uuid,
    pub name: String,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    /// Adapter identifier, resolved through the normalizer registry.
    pub source_type: String,
    /// Adapter-specific configuration.
    pub config: JsonValue,
    /// Record types this feed is authoritative for.
    pub record_types: Vec<RecordType>,
    pub schedule: Option<SyncSchedule>,
    pub fetch_timeout_secs: Option<u64>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DirectorySource {
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    /// Whether the feed is authoritative for `record_type`.
    #[must_use]
    pub fn manages(&self, record_type: RecordType) -> bool {
        self.record_types.contains(&record_type)
    }

    /// Record type used for rows that do not carry one.
    #[must_use]
    pub fn default_record_type(&self) -> RecordType {
        self.record_types.first().copied().unwrap_or(RecordType::Staff)
    }

    /// Adapter config with credential values replaced, safe to return to
    /// callers.
    #[must_use]
    pub fn redacted_config(&self) -> JsonValue {
        let mut config = self.config.clone();
        redact_secrets(&mut config);
        config
    }
}

/// Placeholder for redacted config values.
pub const REDACTED: &str = "***REDACTED***";

/// Key fragments that mark a config value as a credential.
const SECRET_KEY_FRAGMENTS: &[&str] = &["token", "secret", "password", "api_key", "apikey"];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
}

fn redact_secrets(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            for (key, value) in map.iter_mut() {
                if is_secret_key(key) && !value.is_null() {
                    *value = JsonValue::String(REDACTED.to_string());
                } else {
                    redact_secrets(value);
                }
            }
        }
        JsonValue::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

/// Input for registering a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDirectorySource {
    pub name: String,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub source_type: String,
    #[serde(default)]
    pub config: JsonValue,
    /// Empty means every record type.
    #[serde(default)]
    pub record_types: Vec<RecordType>,
    #[serde(default)]
    pub schedule: Option<SyncSchedule>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CreateDirectorySource {
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    /// Build the stored entity.
    #[must_use]
    pub fn into_source(self, now: DateTime<Utc>) -> DirectorySource {
        let mut record_types = if self.record_types.is_empty() {
            RecordType::ALL.to_vec()
        } else {
            self.record_types
        };
        record_types.sort();
        record_types.dedup();

        DirectorySource {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            school_id: self.school_id,
            district_id: self.district_id,
            source_type: self.source_type.trim().to_lowercase(),
            config: if self.config.is_null() {
                JsonValue::Object(serde_json::Map::new())
            } else {
                self.config
            },
            record_types,
            schedule: self.schedule,
            fetch_timeout_secs: self.fetch_timeout_secs,
            enabled: self.enabled,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_source_defaults_record_types() {
        let input = CreateDirectorySource {
            name: "  SIS nightly ".to_string(),
            school_id: Some(Uuid::new_v4()),
            district_id: None,
            source_type: "CSV".to_string(),
            config: JsonValue::Null,
            record_types: vec![],
            schedule: None,
            fetch_timeout_secs: None,
            enabled: true,
        };
        let source = input.into_source(Utc::now());
        assert_eq!(source.name, "SIS nightly");
        assert_eq!(source.source_type, "csv");
        assert_eq!(source.record_types, vec![RecordType::Staff, RecordType::Student]);
        assert_eq!(source.config, json!({}));
        assert!(source.manages(RecordType::Student));
    }

    #[test]
    fn test_redacted_config_hides_credentials() {
        let mut source = CreateDirectorySource {
            name: "SIS API".to_string(),
            school_id: Some(Uuid::new_v4()),
            district_id: None,
            source_type: "http_json".to_string(),
            config: json!({
                "url": "https://sis.example.org/roster",
                "bearer_token": "sis-token",
                "auth": {"client_secret": "s3cr3t", "client_id": "dsync"},
                "rows_pointer": "/data"
            }),
            record_types: vec![],
            schedule: None,
            fetch_timeout_secs: None,
            enabled: true,
        }
        .into_source(Utc::now());

        let redacted = source.redacted_config();
        assert_eq!(redacted["bearer_token"], json!(REDACTED));
        assert_eq!(redacted["auth"]["client_secret"], json!(REDACTED));
        assert_eq!(redacted["auth"]["client_id"], json!("dsync"));
        assert_eq!(redacted["url"], json!("https://sis.example.org/roster"));
        assert_eq!(source.config["bearer_token"], json!("sis-token"));

        source.config = json!({"bearer_token": null});
        assert_eq!(source.redacted_config(), json!({"bearer_token": null}));
    }

    #[test]
    fn test_schedule_defaults_to_utc() {
        let schedule: SyncSchedule = serde_json::from_value(json!({"cron": "0 2 * * *"})).unwrap();
        assert_eq!(schedule.timezone, "UTC");
        assert!(!schedule.deactivate_missing);
    }
}

//! Source adapters that turn raw upstream feeds into normalized rows.
//!
//! Adapters never fail a run for a single bad row: malformed rows come back
//! with a `defect` and are counted by the diff engine. Only whole-feed
//! problems (unreachable endpoint, unreadable file, bad config) are errors.

pub mod csv;
pub mod http;
pub mod inline;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::DirectorySyncConfig;
use crate::models::DirectorySource;
use crate::types::RecordType;

pub use self::csv::CsvNormalizer;
pub use self::http::{FeedUrlPolicy, HttpJsonNormalizer};
pub use self::inline::InlineNormalizer;

/// A feed row in canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    /// Position in the normalized feed.
    pub row_index: usize,
    pub external_id: Option<String>,
    pub record_type: RecordType,
    pub fields: Map<String, JsonValue>,
    /// Why the row could not be read, if it could not.
    pub defect: Option<String>,
}

impl NormalizedRow {
    #[must_use]
    pub fn new(
        row_index: usize,
        external_id: Option<String>,
        record_type: RecordType,
        fields: Map<String, JsonValue>,
    ) -> Self {
        Self {
            row_index,
            external_id,
            record_type,
            fields,
            defect: None,
        }
    }

    /// A row the adapter could not parse.
    #[must_use]
    pub fn defective(row_index: usize, record_type: RecordType, defect: impl Into<String>) -> Self {
        Self {
            row_index,
            external_id: None,
            record_type,
            fields: Map::new(),
            defect: Some(defect.into()),
        }
    }

    /// Trimmed external id, `None` when missing or blank.
    #[must_use]
    pub fn normalized_external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Adapter failures that abort a run.
#[derive(Debug, Error)]
pub enum NormalizerError {
    /// The upstream could not be reached or refused the request.
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    /// The source's adapter configuration is unusable.
    #[error("Invalid source config: {0}")]
    InvalidConfig(String),

    /// The feed as a whole could not be parsed.
    #[error("Malformed feed: {0}")]
    Malformed(String),

    #[error("No adapter registered for source type '{0}'")]
    UnknownSourceType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An upstream feed adapter.
#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Source type this adapter handles.
    fn source_type(&self) -> &str;

    /// Reject a source config this adapter would refuse to fetch.
    ///
    /// Called when a source is created; must not touch the network.
    fn check_config(&self, _config: &JsonValue) -> Result<(), NormalizerError> {
        Ok(())
    }

    /// Fetch and normalize every row of the source's feed.
    async fn normalize(
        &self,
        source: &DirectorySource,
    ) -> Result<Vec<NormalizedRow>, NormalizerError>;
}

/// Adapters keyed by source type.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    adapters: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `csv`, `inline` and `http_json` adapters.
    ///
    /// File paths are disabled and feeds may only reach public hosts.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_config(&DirectorySyncConfig::default())
    }

    /// Built-in adapters restricted by the feed access settings of `config`.
    #[must_use]
    pub fn from_config(config: &DirectorySyncConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CsvNormalizer::with_root(
            config.csv_root_dir.as_ref().map(std::path::PathBuf::from),
        )));
        registry.register(Arc::new(InlineNormalizer::new()));
        registry.register(Arc::new(HttpJsonNormalizer::new().with_policy(FeedUrlPolicy {
            allowed_hosts: config.http_allowed_hosts.clone(),
            allow_private_networks: config.http_allow_private_networks,
        })));
        registry
    }

    /// Add or replace an adapter.
    pub fn register(&mut self, adapter: Arc<dyn Normalizer>) {
        self.adapters
            .insert(adapter.source_type().to_lowercase(), adapter);
    }

    #[must_use]
    pub fn get(&self, source_type: &str) -> Option<Arc<dyn Normalizer>> {
        self.adapters.get(&source_type.to_lowercase()).cloned()
    }

    #[must_use]
    pub fn supports(&self, source_type: &str) -> bool {
        self.adapters.contains_key(&source_type.to_lowercase())
    }

    /// Registered source types, sorted.
    #[must_use]
    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for NormalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerRegistry")
            .field("source_types", &self.source_types())
            .finish()
    }
}

/// Field names used when reading JSON object rows.
#[derive(Debug, Clone)]
pub(crate) struct ObjectRowFields<'a> {
    pub external_id_field: &'a str,
    pub record_type_field: &'a str,
    pub default_record_type: RecordType,
}

/// Normalize one JSON object row (inline and HTTP adapters).
pub(crate) fn row_from_json(
    row_index: usize,
    value: &JsonValue,
    names: &ObjectRowFields<'_>,
) -> NormalizedRow {
    let Some(object) = value.as_object() else {
        return NormalizedRow::defective(
            row_index,
            names.default_record_type,
            "Row is not a JSON object",
        );
    };

    let record_type = match object.get(names.record_type_field) {
        None | Some(JsonValue::Null) => names.default_record_type,
        Some(JsonValue::String(raw)) => match raw.parse::<RecordType>() {
            Ok(record_type) => record_type,
            Err(e) => return NormalizedRow::defective(row_index, names.default_record_type, e),
        },
        Some(other) => {
            return NormalizedRow::defective(
                row_index,
                names.default_record_type,
                format!("Unsupported record type value: {other}"),
            )
        }
    };

    let external_id = match object.get(names.external_id_field) {
        Some(JsonValue::String(id)) => Some(id.trim().to_string()),
        Some(JsonValue::Number(id)) => Some(id.to_string()),
        _ => None,
    };

    let fields = object
        .iter()
        .filter(|(key, _)| {
            key.as_str() != names.external_id_field && key.as_str() != names.record_type_field
        })
        .map(|(key, value)| (key.clone(), normalize_value(value)))
        .collect();

    NormalizedRow::new(row_index, external_id, record_type, fields)
}

/// Trim string values; other values pass through.
pub(crate) fn normalize_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// Deserialize an adapter config, mapping failures to `InvalidConfig`.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    source: &DirectorySource,
) -> Result<T, NormalizerError> {
    parse_config_value(&source.config)
}

pub(crate) fn parse_config_value<T: serde::de::DeserializeOwned>(
    config: &JsonValue,
) -> Result<T, NormalizerError> {
    serde_json::from_value(config.clone()).map_err(|e| NormalizerError::InvalidConfig(e.to_string()))
}

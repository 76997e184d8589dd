//! Inline JSON rows stored directly on the source config.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{parse_config, row_from_json, NormalizedRow, Normalizer, NormalizerError, ObjectRowFields};
use crate::models::DirectorySource;
use crate::types::RecordType;

/// `config` of an `inline` source.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineSourceConfig {
    #[serde(default)]
    pub rows: Vec<JsonValue>,
    #[serde(default = "default_external_id_field")]
    pub external_id_field: String,
    #[serde(default = "default_record_type_field")]
    pub record_type_field: String,
    #[serde(default)]
    pub record_type: Option<RecordType>,
}

pub(crate) fn default_external_id_field() -> String {
    "external_id".to_string()
}

pub(crate) fn default_record_type_field() -> String {
    "record_type".to_string()
}

/// Adapter for `source_type = "inline"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineNormalizer;

impl InlineNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Normalizer for InlineNormalizer {
    fn source_type(&self) -> &str {
        "inline"
    }

    async fn normalize(
        &self,
        source: &DirectorySource,
    ) -> Result<Vec<NormalizedRow>, NormalizerError> {
        let config: InlineSourceConfig = parse_config(source)?;
        let names = ObjectRowFields {
            external_id_field: &config.external_id_field,
            record_type_field: &config.record_type_field,
            default_record_type: config
                .record_type
                .unwrap_or_else(|| source.default_record_type()),
        };

        Ok(config
            .rows
            .iter()
            .enumerate()
            .map(|(row_index, value)| row_from_json(row_index, value, &names))
            .collect())
    }
}

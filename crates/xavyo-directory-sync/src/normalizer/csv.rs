//! CSV feed adapter.
//!
//! Reads CSV text either embedded in the source config (`data`) or from a
//! file under the configured CSV root (`path`). The header row names the
//! fields; the external id column and optional record type column are
//! lifted out of `fields`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::{parse_config, parse_config_value, NormalizedRow, Normalizer, NormalizerError};
use crate::models::DirectorySource;
use crate::types::RecordType;

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// `config` of a `csv` source.
#[derive(Debug, Clone, Deserialize)]
pub struct CsvSourceConfig {
    /// Inline CSV text.
    #[serde(default)]
    pub data: Option<String>,
    /// CSV file path, relative to the CSV root.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_external_id_column")]
    pub external_id_column: String,
    /// Record type for every row when no type column is configured.
    #[serde(default)]
    pub record_type: Option<RecordType>,
    #[serde(default)]
    pub record_type_column: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_external_id_column() -> String {
    "external_id".to_string()
}

fn default_delimiter() -> char {
    ','
}

impl CsvSourceConfig {
    fn delimiter_byte(&self) -> Result<u8, NormalizerError> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(NormalizerError::InvalidConfig(format!(
                "Delimiter must be a single ASCII character, got '{}'",
                self.delimiter
            )))
        }
    }
}

/// Adapter for `source_type = "csv"`.
///
/// Without a root directory only inline `data` is accepted.
#[derive(Debug, Clone, Default)]
pub struct CsvNormalizer {
    root: Option<PathBuf>,
}

impl CsvNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `path` sources, confined to files under `root`.
    #[must_use]
    pub fn with_root(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn root(&self) -> Result<&Path, NormalizerError> {
        self.root.as_deref().ok_or_else(|| {
            NormalizerError::InvalidConfig(
                "CSV file paths are disabled; set DIRECTORY_SYNC_CSV_ROOT_DIR or use 'data'"
                    .to_string(),
            )
        })
    }

    /// Lexical checks: relative, no parent components.
    fn check_path(&self, path: &str) -> Result<(), NormalizerError> {
        self.root()?;
        let candidate = Path::new(path);
        let escapes = candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || escapes {
            return Err(NormalizerError::InvalidConfig(format!(
                "CSV path '{path}' must be relative to the CSV root"
            )));
        }
        Ok(())
    }

    /// Resolve `path` under the root, following symlinks before the
    /// containment check.
    async fn resolve(&self, path: &str) -> Result<PathBuf, NormalizerError> {
        self.check_path(path)?;
        let root = tokio::fs::canonicalize(self.root()?).await?;
        let resolved = tokio::fs::canonicalize(root.join(path))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NormalizerError::Unreachable(format!("CSV file not found: {path}"))
                } else {
                    NormalizerError::Io(e)
                }
            })?;
        if !resolved.starts_with(&root) {
            return Err(NormalizerError::InvalidConfig(format!(
                "CSV path '{path}' resolves outside the CSV root"
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Normalizer for CsvNormalizer {
    fn source_type(&self) -> &str {
        "csv"
    }

    fn check_config(&self, config: &JsonValue) -> Result<(), NormalizerError> {
        let config: CsvSourceConfig = parse_config_value(config)?;
        config.delimiter_byte()?;
        match (&config.data, &config.path) {
            (Some(_), None) => Ok(()),
            (None, Some(path)) => self.check_path(path),
            (Some(_), Some(_)) => Err(NormalizerError::InvalidConfig(
                "CSV source takes either 'data' or 'path', not both".to_string(),
            )),
            (None, None) => Err(NormalizerError::InvalidConfig(
                "CSV source needs either 'data' or 'path'".to_string(),
            )),
        }
    }

    async fn normalize(
        &self,
        source: &DirectorySource,
    ) -> Result<Vec<NormalizedRow>, NormalizerError> {
        let config: CsvSourceConfig = parse_config(source)?;
        let bytes = match (&config.data, &config.path) {
            (Some(data), _) => data.clone().into_bytes(),
            (None, Some(path)) => tokio::fs::read(self.resolve(path).await?).await?,
            (None, None) => {
                return Err(NormalizerError::InvalidConfig(
                    "CSV source needs either 'data' or 'path'".to_string(),
                ))
            }
        };
        let default_type = config
            .record_type
            .unwrap_or_else(|| source.default_record_type());
        parse_rows(&bytes, &config, default_type)
    }
}

fn strip_utf8_bom(data: &[u8]) -> &[u8] {
    if data.starts_with(UTF8_BOM) {
        &data[UTF8_BOM.len()..]
    } else {
        data
    }
}

/// Parse CSV bytes into normalized rows.
///
/// Fails only on feed-level problems (empty input, unreadable header,
/// missing id column). Bad records become defective rows.
pub fn parse_rows(
    data: &[u8],
    config: &CsvSourceConfig,
    default_record_type: RecordType,
) -> Result<Vec<NormalizedRow>, NormalizerError> {
    let data = strip_utf8_bom(data);
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(NormalizerError::Malformed("CSV feed is empty".to_string()));
    }

    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(config.delimiter_byte()?)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| NormalizerError::Malformed(format!("Failed to read CSV headers: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let columns: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    let id_idx = *columns
        .get(config.external_id_column.as_str())
        .ok_or_else(|| {
            NormalizerError::Malformed(format!(
                "CSV header is missing the '{}' column",
                config.external_id_column
            ))
        })?;

    let type_idx = match &config.record_type_column {
        Some(column) => Some(*columns.get(column.as_str()).ok_or_else(|| {
            NormalizerError::Malformed(format!("CSV header is missing the '{column}' column"))
        })?),
        None => None,
    };

    let mut rows = Vec::new();
    for (row_index, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                rows.push(NormalizedRow::defective(
                    row_index,
                    default_record_type,
                    format!("Failed to parse CSV row: {e}"),
                ));
                continue;
            }
        };

        if record.len() > headers.len() {
            rows.push(NormalizedRow::defective(
                row_index,
                default_record_type,
                format!(
                    "Row has {} fields but the header has {}",
                    record.len(),
                    headers.len()
                ),
            ));
            continue;
        }

        let record_type = match type_idx.and_then(|idx| record.get(idx)).map(str::trim) {
            Some(raw) if !raw.is_empty() => match raw.parse::<RecordType>() {
                Ok(record_type) => record_type,
                Err(e) => {
                    rows.push(NormalizedRow::defective(row_index, default_record_type, e));
                    continue;
                }
            },
            _ => default_record_type,
        };

        let external_id = record
            .get(id_idx)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let mut fields = Map::new();
        for (idx, value) in record.iter().enumerate() {
            if idx == id_idx || Some(idx) == type_idx {
                continue;
            }
            let value = value.trim();
            // Empty cells are absent, not a request to clear the field.
            if value.is_empty() {
                continue;
            }
            if let Some(name) = headers.get(idx).filter(|name| !name.is_empty()) {
                fields.insert(name.clone(), JsonValue::String(value.to_string()));
            }
        }

        rows.push(NormalizedRow::new(row_index, external_id, record_type, fields));
    }

    Ok(rows)
}

//! Diff engine.
//!
//! Compares normalized feed rows against the canonical records of a scope
//! and classifies every external id as an add, an update, a deactivation
//! candidate or unchanged. The computation is pure: same input, same output,
//! no I/O and no clock.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::models::CanonicalRecord;
use crate::normalizer::NormalizedRow;
use crate::statistics::{count_u32, ErrorCollector, RowError, SyncStats};
use crate::types::{RecordType, Scope};

/// A record present only in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddItem {
    pub external_id: String,
    pub record_type: RecordType,
    pub fields: Map<String, JsonValue>,
}

/// One changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Canonical value, `None` when the field was absent.
    pub from: Option<JsonValue>,
    pub to: JsonValue,
}

/// A record present on both sides with at least one difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub external_id: String,
    pub record_id: Uuid,
    pub record_type: RecordType,
    /// Changed fields only.
    pub changes: BTreeMap<String, FieldChange>,
    /// Set when the feed moved the record to another record type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_record_type: Option<RecordType>,
    /// The canonical record is inactive and reappeared in the feed.
    #[serde(default)]
    pub reactivate: bool,
}

/// An active canonical record missing from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationCandidate {
    pub external_id: String,
    pub record_id: Uuid,
    pub record_type: RecordType,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Classified changes, each list sorted by external id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub adds: Vec<AddItem>,
    #[serde(default)]
    pub updates: Vec<UpdateItem>,
    #[serde(default)]
    pub deactivation_candidates: Vec<DeactivationCandidate>,
}

impl Diff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty() && self.deactivation_candidates.is_empty()
    }

    /// Candidate external ids, for approval metadata.
    #[must_use]
    pub fn candidate_ids(&self, limit: usize) -> Vec<&str> {
        self.deactivation_candidates
            .iter()
            .take(limit)
            .map(|c| c.external_id.as_str())
            .collect()
    }
}

/// Comparison options.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Restrict comparison to these fields. `None` compares every field
    /// the feed supplies.
    pub tracked_fields: Option<BTreeSet<String>>,
    /// Compare string values case-insensitively.
    pub ignore_case: bool,
    /// Row errors kept in the outcome.
    pub max_row_errors: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            tracked_fields: None,
            ignore_case: false,
            max_row_errors: 500,
        }
    }
}

impl DiffOptions {
    fn tracks(&self, field: &str) -> bool {
        self.tracked_fields
            .as_ref()
            .map_or(true, |fields| fields.contains(field))
    }
}

/// Result of [`compute_diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    pub diff: Diff,
    pub stats: SyncStats,
    /// Row errors ordered by row index, capped at `max_row_errors`.
    pub errors: Vec<RowError>,
    pub errors_truncated: u32,
}

/// Compare `incoming` rows against the `canonical` records inside `scope`.
#[must_use]
pub fn compute_diff(
    scope: &Scope,
    canonical: &[CanonicalRecord],
    incoming: &[NormalizedRow],
    options: &DiffOptions,
) -> DiffOutcome {
    let mut row_errors = Vec::new();
    let mut latest: BTreeMap<&str, &NormalizedRow> = BTreeMap::new();

    for row in incoming {
        if let Some(defect) = &row.defect {
            row_errors.push(RowError::invalid(row.row_index, defect.clone()));
            continue;
        }
        let Some(external_id) = row.normalized_external_id() else {
            row_errors.push(RowError::missing_external_id(row.row_index));
            continue;
        };
        // Last occurrence wins.
        if let Some(previous) = latest.insert(external_id, row) {
            row_errors.push(RowError::duplicate(
                previous.row_index,
                external_id,
                row.row_index,
            ));
        }
    }

    let mut existing: BTreeMap<&str, &CanonicalRecord> = BTreeMap::new();
    for record in canonical
        .iter()
        .filter(|r| scope.contains(r.school_id, r.district_id))
    {
        existing
            .entry(record.external_id.as_str())
            .and_modify(|current| {
                // Prefer the active copy when the store holds duplicates.
                if !current.active && record.active {
                    *current = record;
                }
            })
            .or_insert(record);
    }

    let mut diff = Diff::default();
    let mut unchanged = 0u32;

    for (external_id, row) in &latest {
        match existing.get(*external_id) {
            None => diff.adds.push(AddItem {
                external_id: (*external_id).to_string(),
                record_type: row.record_type,
                fields: row.fields.clone(),
            }),
            Some(record) => {
                let changes = field_changes(record, row, options);
                let previous_record_type =
                    (record.record_type != row.record_type).then_some(record.record_type);
                let reactivate = !record.active;
                if changes.is_empty() && previous_record_type.is_none() && !reactivate {
                    unchanged += 1;
                } else {
                    diff.updates.push(UpdateItem {
                        external_id: (*external_id).to_string(),
                        record_id: record.id,
                        record_type: row.record_type,
                        changes,
                        previous_record_type,
                        reactivate,
                    });
                }
            }
        }
    }

    for (external_id, record) in &existing {
        if latest.contains_key(*external_id) {
            continue;
        }
        if record.active {
            diff.deactivation_candidates.push(DeactivationCandidate {
                external_id: (*external_id).to_string(),
                record_id: record.id,
                record_type: record.record_type,
                display_name: record.display_name(),
            });
        } else {
            unchanged += 1;
        }
    }

    let total_rows = count_u32(incoming.len());
    let invalid_rows = count_u32(row_errors.len());
    let adds = count_u32(diff.adds.len());
    let updates = count_u32(diff.updates.len());
    let candidates = count_u32(diff.deactivation_candidates.len());
    let stats = SyncStats {
        total_rows,
        valid_rows: total_rows.saturating_sub(invalid_rows),
        invalid_rows,
        adds,
        updates,
        unchanged,
        deactivation_candidates: candidates,
        upserted: adds + updates,
        deactivated: candidates,
        dry_run: false,
        duration_ms: 0,
    };

    row_errors.sort_by_key(|e| e.row_index);
    let mut collector = ErrorCollector::new(options.max_row_errors);
    collector.extend(row_errors);
    let (errors, errors_truncated) = collector.into_parts();

    DiffOutcome {
        diff,
        stats,
        errors,
        errors_truncated,
    }
}

fn field_changes(
    record: &CanonicalRecord,
    row: &NormalizedRow,
    options: &DiffOptions,
) -> BTreeMap<String, FieldChange> {
    row.fields
        .iter()
        .filter(|(field, _)| options.tracks(field))
        .filter_map(|(field, incoming)| {
            let current = record.fields.get(field);
            if values_equal(current, incoming, options.ignore_case) {
                None
            } else {
                Some((
                    field.clone(),
                    FieldChange {
                        from: current.cloned(),
                        to: incoming.clone(),
                    },
                ))
            }
        })
        .collect()
}

fn values_equal(current: Option<&JsonValue>, incoming: &JsonValue, ignore_case: bool) -> bool {
    match (current, incoming) {
        (None, JsonValue::Null) => true,
        (None, _) => false,
        (Some(JsonValue::String(a)), JsonValue::String(b)) if ignore_case => {
            a.to_lowercase() == b.to_lowercase()
        }
        (Some(a), b) => a == b,
    }
}

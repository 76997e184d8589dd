//! Run statistics and bounded error collection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistics for a single sync run.
///
/// `upserted` and `deactivated` are projections of what an apply would
/// write; the ops summary tracks what applies actually wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Rows returned by the normalizer.
    #[serde(default)]
    pub total_rows: u32,
    /// Rows that took part in the diff.
    #[serde(default)]
    pub valid_rows: u32,
    /// Rows rejected (defective, missing id, superseded duplicate).
    #[serde(default)]
    pub invalid_rows: u32,
    #[serde(default)]
    pub adds: u32,
    #[serde(default)]
    pub updates: u32,
    #[serde(default)]
    pub unchanged: u32,
    #[serde(default)]
    pub deactivation_candidates: u32,
    /// Projected upserts (adds + updates).
    #[serde(default)]
    pub upserted: u32,
    /// Projected deactivations.
    #[serde(default)]
    pub deactivated: u32,
    #[serde(default)]
    pub dry_run: bool,
    /// Wall time of the run in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl SyncStats {
    /// Create new empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records the preview would touch.
    #[must_use]
    pub fn change_count(&self) -> u32 {
        self.adds + self.updates + self.deactivation_candidates
    }

    /// Whether the preview is a no-op.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.change_count() == 0
    }
}

/// Why a row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorReason {
    MissingExternalId,
    DuplicateExternalId,
    InvalidRow,
}

impl RowErrorReason {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RowErrorReason::MissingExternalId => "missing_external_id",
            RowErrorReason::DuplicateExternalId => "duplicate_external_id",
            RowErrorReason::InvalidRow => "invalid_row",
        }
    }
}

impl fmt::Display for RowErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rejected incoming row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Position of the row in the normalized input.
    pub row_index: usize,
    pub reason: RowErrorReason,
    pub message: String,
}

impl RowError {
    #[must_use]
    pub fn missing_external_id(row_index: usize) -> Self {
        Self {
            row_index,
            reason: RowErrorReason::MissingExternalId,
            message: "Row has no external id".to_string(),
        }
    }

    /// The row at `row_index` was superseded by a later row with the same id.
    #[must_use]
    pub fn duplicate(row_index: usize, external_id: &str, kept_row_index: usize) -> Self {
        Self {
            row_index,
            reason: RowErrorReason::DuplicateExternalId,
            message: format!(
                "Duplicate external id '{external_id}', superseded by row {kept_row_index}"
            ),
        }
    }

    #[must_use]
    pub fn invalid(row_index: usize, message: impl Into<String>) -> Self {
        Self {
            row_index,
            reason: RowErrorReason::InvalidRow,
            message: message.into(),
        }
    }
}

/// Collects at most `capacity` items and counts the overflow.
#[derive(Debug, Clone)]
pub struct ErrorCollector<T> {
    items: Vec<T>,
    capacity: usize,
    dropped: u32,
}

impl<T> ErrorCollector<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    /// Items seen, kept or not.
    #[must_use]
    pub fn total(&self) -> usize {
        self.items.len() + self.dropped as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Kept items and the number dropped.
    #[must_use]
    pub fn into_parts(self) -> (Vec<T>, u32) {
        (self.items, self.dropped)
    }
}

impl<T> Extend<T> for ErrorCollector<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

/// Saturating `usize` to `u32` for counters.
pub(crate) fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

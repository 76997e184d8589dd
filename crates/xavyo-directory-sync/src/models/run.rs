//! Source runs: one execution of fetch, normalize and diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::source::DirectorySource;
use crate::statistics::{RowError, SyncStats};
use crate::types::{RunStatus, Scope};

/// Options for a single sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Propose deactivations for active records missing from the feed.
    #[serde(default)]
    pub deactivate_missing: bool,
    /// Produce a preview that can never be applied.
    #[serde(default)]
    pub dry_run: bool,
}

/// A run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRun {
    pub id: Uuid,
    pub source_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub status: RunStatus,
    pub dry_run: bool,
    pub deactivate_missing: bool,
    /// `None` for scheduled runs.
    pub triggered_by: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: SyncStats,
    pub errors: Vec<RowError>,
    /// Row errors dropped after the cap.
    pub errors_truncated: u32,
    /// Fatal reason for failed runs.
    pub error_message: Option<String>,
    pub preview_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SourceRun {
    /// A freshly admitted run.
    #[must_use]
    pub fn queued(
        source: &DirectorySource,
        options: SyncOptions,
        triggered_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source.id,
            school_id: source.school_id,
            district_id: source.district_id,
            status: RunStatus::Queued,
            dry_run: options.dry_run,
            deactivate_missing: options.deactivate_missing,
            triggered_by,
            started_at: None,
            finished_at: None,
            stats: SyncStats {
                dry_run: options.dry_run,
                ..SyncStats::default()
            },
            errors: Vec::new(),
            errors_truncated: 0,
            error_message: None,
            preview_id: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    /// Fold a terminal outcome into the run.
    pub fn finish(&mut self, finish: RunFinish) {
        self.status = finish.status;
        self.finished_at = Some(finish.finished_at);
        self.stats = finish.stats;
        self.errors = finish.errors;
        self.errors_truncated = finish.errors_truncated;
        self.error_message = finish.error_message;
        self.preview_id = finish.preview_id;
    }
}

/// Terminal outcome written by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub stats: SyncStats,
    pub errors: Vec<RowError>,
    pub errors_truncated: u32,
    pub error_message: Option<String>,
    pub preview_id: Option<Uuid>,
}

impl RunFinish {
    #[must_use]
    pub fn succeeded(
        finished_at: DateTime<Utc>,
        stats: SyncStats,
        errors: Vec<RowError>,
        errors_truncated: u32,
        preview_id: Uuid,
    ) -> Self {
        Self {
            status: RunStatus::Succeeded,
            finished_at,
            stats,
            errors,
            errors_truncated,
            error_message: None,
            preview_id: Some(preview_id),
        }
    }

    #[must_use]
    pub fn failed(finished_at: DateTime<Utc>, stats: SyncStats, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            finished_at,
            stats,
            errors: Vec::new(),
            errors_truncated: 0,
            error_message: Some(message.into()),
            preview_id: None,
        }
    }
}

//! Previews: the persisted diff of a successful run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::apply::ApplyResult;
use crate::diff::Diff;
use crate::statistics::SyncStats;
use crate::types::Scope;

/// A persisted diff awaiting (or past) apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_run_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub diff: Diff,
    pub stats: SyncStats,
    pub deactivate_missing: bool,
    pub dry_run: bool,
    pub requires_approval: bool,
    pub approval_id: Option<Uuid>,
    /// Job currently holding the apply claim.
    pub apply_job_id: Option<Uuid>,
    pub apply_claimed_at: Option<DateTime<Utc>>,
    /// Result of the one apply that ran, replayed on retries.
    pub apply_result: Option<ApplyResult>,
    pub applied_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Preview {
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

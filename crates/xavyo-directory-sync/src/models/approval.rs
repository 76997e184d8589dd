//! Deactivation approvals gating destructive previews.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::statistics::SyncStats;
use crate::types::{ApprovalStatus, Scope};

/// Approval record for a preview that proposes deactivations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationApproval {
    pub id: Uuid,
    pub preview_id: Uuid,
    pub source_id: Uuid,
    pub source_run_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub status: ApprovalStatus,
    pub requested_by: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    /// Set once, by the apply executor, and only while approved.
    pub applied_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Stats snapshot of the preview at request time.
    pub stats: SyncStats,
    pub metadata: JsonValue,
}

impl DeactivationApproval {
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Status as seen by readers: a pending approval past expiry reads as expired.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.status == ApprovalStatus::Pending && self.is_expired(now) {
            ApprovalStatus::Expired
        } else {
            self.status
        }
    }

    /// A copy carrying the effective status, for read paths.
    #[must_use]
    pub fn with_effective_status(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.effective_status(now);
        self
    }
}

/// A CAS transition out of `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalTransition {
    pub to: ApprovalStatus,
    pub decided_by: Option<Uuid>,
    pub decided_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ApprovalTransition {
    /// Lazy expiry, attributed to nobody.
    #[must_use]
    pub fn expire(at: DateTime<Utc>) -> Self {
        Self {
            to: ApprovalStatus::Expired,
            decided_by: None,
            decided_at: at,
            reason: None,
        }
    }
}

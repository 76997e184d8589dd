//! Error taxonomy for directory sync operations.
//!
//! Every variant maps to a stable machine code via [`DirectorySyncError::code`];
//! the HTTP layer uses that code for its problem type URIs.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::types::ApprovalStatus;

/// Errors returned by the sync service.
#[derive(Debug, Error)]
pub enum DirectorySyncError {
    /// Source does not exist or is outside the caller's scope.
    #[error("Directory source not found: {source_id}")]
    SourceNotFound { source_id: Uuid },

    /// Source is soft-disabled.
    #[error("Directory source {source_id} is disabled")]
    SourceDisabled { source_id: Uuid },

    /// A queued or running run already exists for the source.
    #[error("A sync is already in progress for source {source_id} (run {run_id})")]
    RunInProgress { source_id: Uuid, run_id: Uuid },

    #[error("Source run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("Preview not found: {preview_id}")]
    PreviewNotFound { preview_id: Uuid },

    #[error("Approval not found: {approval_id}")]
    ApprovalNotFound { approval_id: Uuid },

    /// The approval already reached a different terminal decision.
    #[error("Approval {approval_id} is already {status}")]
    ApprovalClosed {
        approval_id: Uuid,
        status: ApprovalStatus,
    },

    #[error("Approval {approval_id} expired at {expires_at}")]
    ApprovalExpired {
        approval_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    /// Apply was requested before an approval decision.
    #[error("Approval {approval_id} is {status}, not approved")]
    ApprovalNotApproved {
        approval_id: Uuid,
        status: ApprovalStatus,
    },

    /// Another job holds the apply claim.
    #[error("Preview {preview_id} is being applied by job {job_id}")]
    ApplyInProgress { preview_id: Uuid, job_id: Uuid },

    #[error("Preview {preview_id} expired at {expires_at}")]
    PreviewExpired {
        preview_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    /// Preview cannot be applied through the requested path.
    #[error("Preview {preview_id} cannot be applied: {reason}")]
    PreviewNotApplicable { preview_id: Uuid, reason: String },

    /// Upstream feed could not be read.
    #[error("Source adapter '{source_type}' failed: {message}")]
    AdapterUnreachable { source_type: String, message: String },

    /// Fetch exceeded the source's timeout.
    #[error("Fetching source {source_id} timed out after {timeout_secs}s")]
    Timeout { source_id: Uuid, timeout_secs: u64 },

    /// Caller input rejected.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DirectorySyncError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceNotFound { .. } => "source_not_found",
            Self::SourceDisabled { .. } => "source_disabled",
            Self::RunInProgress { .. } => "run_in_progress",
            Self::RunNotFound { .. } => "run_not_found",
            Self::PreviewNotFound { .. } => "preview_not_found",
            Self::ApprovalNotFound { .. } => "approval_not_found",
            Self::ApprovalClosed { .. } => "approval_closed",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::ApprovalNotApproved { .. } => "approval_not_approved",
            Self::ApplyInProgress { .. } => "apply_in_progress",
            Self::PreviewExpired { .. } => "preview_expired",
            Self::PreviewNotApplicable { .. } => "preview_not_applicable",
            Self::AdapterUnreachable { .. } => "adapter_unreachable",
            Self::Timeout { .. } => "timeout",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Entity missing or outside scope.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound { .. }
                | Self::RunNotFound { .. }
                | Self::PreviewNotFound { .. }
                | Self::ApprovalNotFound { .. }
        )
    }

    /// State conflict the caller can resolve by waiting or re-reading.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::RunInProgress { .. }
                | Self::SourceDisabled { .. }
                | Self::ApprovalClosed { .. }
                | Self::ApprovalNotApproved { .. }
                | Self::ApplyInProgress { .. }
                | Self::PreviewNotApplicable { .. }
        )
    }

    /// Whether the same request may succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RunInProgress { .. }
                | Self::ApplyInProgress { .. }
                | Self::AdapterUnreachable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Internal failure whose details should not reach callers.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Serialization(_) | Self::Internal(_)
        )
    }
}

/// Result alias for service operations.
pub type DirectorySyncResult<T> = Result<T, DirectorySyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let id = Uuid::new_v4();
        assert_eq!(
            DirectorySyncError::RunInProgress {
                source_id: id,
                run_id: id
            }
            .code(),
            "run_in_progress"
        );
        assert_eq!(
            DirectorySyncError::ApprovalExpired {
                approval_id: id,
                expires_at: Utc::now()
            }
            .code(),
            "approval_expired"
        );
        assert_eq!(
            DirectorySyncError::Validation("x".into()).code(),
            "validation"
        );
    }

    #[test]
    fn test_classification() {
        let id = Uuid::new_v4();
        assert!(DirectorySyncError::ApprovalNotFound { approval_id: id }.is_not_found());
        assert!(DirectorySyncError::ApplyInProgress {
            preview_id: id,
            job_id: id
        }
        .is_conflict());
        assert!(DirectorySyncError::Timeout {
            source_id: id,
            timeout_secs: 60
        }
        .is_retryable());
        assert!(!DirectorySyncError::ApprovalClosed {
            approval_id: id,
            status: ApprovalStatus::Rejected
        }
        .is_retryable());
        assert!(DirectorySyncError::Store(StoreError::Internal("boom".into())).is_internal());
    }
}

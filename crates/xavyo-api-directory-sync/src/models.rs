//! API request/response models for directory sync.
//!
//! Requests derive `Validate`; every model derives `ToSchema` for the
//! `OpenAPI` document. Nested library types are documented as plain objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;
use xavyo_directory_sync::{
    ApplyItemError, ApplyResult, ApprovalDetail, CreateDirectorySource, DeactivationApproval,
    DirectorySource, OpsSummary, Preview, RecordType, RowError, SourceRun, SyncOptions,
    SyncSchedule, SyncSourceResult, SyncStats,
};

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

/// Register a directory source.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateSourceRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,

    pub school_id: Option<Uuid>,

    pub district_id: Option<Uuid>,

    /// Adapter identifier: `csv`, `inline` or `http_json`.
    #[validate(length(min = 1, max = 64))]
    pub source_type: String,

    /// Adapter configuration.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: JsonValue,

    /// Record types the feed is authoritative for (`staff`, `student`).
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub record_types: Vec<RecordType>,

    /// `{cron, timezone, deactivate_missing}`.
    #[schema(value_type = Option<Object>)]
    pub schedule: Option<SyncSchedule>,

    #[validate(range(min = 1, max = 3600))]
    pub fetch_timeout_secs: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CreateSourceRequest {
    #[must_use]
    pub fn into_input(self) -> CreateDirectorySource {
        CreateDirectorySource {
            name: self.name,
            school_id: self.school_id,
            district_id: self.district_id,
            source_type: self.source_type,
            config: self.config,
            record_types: self.record_types,
            schedule: self.schedule,
            fetch_timeout_secs: self.fetch_timeout_secs,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SourceResponse {
    pub id: Uuid,
    pub name: String,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub source_type: String,
    /// Adapter config with credentials shown as `***REDACTED***`.
    #[schema(value_type = Object)]
    pub config: JsonValue,
    #[schema(value_type = Vec<String>)]
    pub record_types: Vec<RecordType>,
    #[schema(value_type = Option<Object>)]
    pub schedule: Option<SyncSchedule>,
    pub fetch_timeout_secs: Option<u64>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DirectorySource> for SourceResponse {
    fn from(source: DirectorySource) -> Self {
        let config = source.redacted_config();
        Self {
            id: source.id,
            name: source.name,
            school_id: source.school_id,
            district_id: source.district_id,
            source_type: source.source_type,
            config,
            record_types: source.record_types,
            schedule: source.schedule,
            fetch_timeout_secs: source.fetch_timeout_secs,
            enabled: source.enabled,
            last_run_at: source.last_run_at,
            created_at: source.created_at,
            updated_at: source.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Options for a manual sync. An empty body means a plain, ungated run.
#[derive(Debug, Clone, Copy, Default, Deserialize, ToSchema)]
pub struct SyncSourceRequest {
    #[serde(default)]
    pub deactivate_missing: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl From<SyncSourceRequest> for SyncOptions {
    fn from(req: SyncSourceRequest) -> Self {
        SyncOptions {
            deactivate_missing: req.deactivate_missing,
            dry_run: req.dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncSourceResponse {
    pub run_id: Uuid,
    pub preview_id: Uuid,
    pub requires_approval: bool,
    pub approval_id: Option<Uuid>,
    #[schema(value_type = Object)]
    pub stats: SyncStats,
    #[schema(value_type = Vec<Object>)]
    pub errors: Vec<RowError>,
    pub errors_truncated: u32,
}

impl From<SyncSourceResult> for SyncSourceResponse {
    fn from(result: SyncSourceResult) -> Self {
        Self {
            run_id: result.run_id,
            preview_id: result.preview_id,
            requires_approval: result.requires_approval,
            approval_id: result.approval_id,
            stats: result.stats,
            errors: result.errors,
            errors_truncated: result.errors_truncated,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListRunsQuery {
    /// Maximum results (default 50, max 200).
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunResponse {
    pub id: Uuid,
    pub source_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    /// `queued`, `running`, `succeeded` or `failed`.
    pub status: String,
    pub dry_run: bool,
    pub deactivate_missing: bool,
    pub triggered_by: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[schema(value_type = Object)]
    pub stats: SyncStats,
    #[schema(value_type = Vec<Object>)]
    pub errors: Vec<RowError>,
    pub errors_truncated: u32,
    pub error_message: Option<String>,
    pub preview_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<SourceRun> for RunResponse {
    fn from(run: SourceRun) -> Self {
        Self {
            id: run.id,
            source_id: run.source_id,
            school_id: run.school_id,
            district_id: run.district_id,
            status: run.status.as_str().to_string(),
            dry_run: run.dry_run,
            deactivate_missing: run.deactivate_missing,
            triggered_by: run.triggered_by,
            started_at: run.started_at,
            finished_at: run.finished_at,
            stats: run.stats,
            errors: run.errors,
            errors_truncated: run.errors_truncated,
            error_message: run.error_message,
            preview_id: run.preview_id,
            created_at: run.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Previews
// ---------------------------------------------------------------------------

/// A preview as returned to clients. The internal claim fields are omitted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PreviewResponse {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_run_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    /// `{adds, updates, deactivation_candidates}`.
    #[schema(value_type = Object)]
    pub diff: JsonValue,
    #[schema(value_type = Object)]
    pub stats: SyncStats,
    pub deactivate_missing: bool,
    pub dry_run: bool,
    pub requires_approval: bool,
    pub approval_id: Option<Uuid>,
    pub applied_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<Preview> for PreviewResponse {
    type Error = ApiError;

    fn try_from(preview: Preview) -> Result<Self, Self::Error> {
        let diff = serde_json::to_value(&preview.diff)
            .map_err(|e| ApiError::Sync(e.into()))?;
        Ok(Self {
            id: preview.id,
            source_id: preview.source_id,
            source_run_id: preview.source_run_id,
            school_id: preview.school_id,
            district_id: preview.district_id,
            diff,
            stats: preview.stats,
            deactivate_missing: preview.deactivate_missing,
            dry_run: preview.dry_run,
            requires_approval: preview.requires_approval,
            approval_id: preview.approval_id,
            applied_at: preview.applied_at,
            expires_at: preview.expires_at,
            created_at: preview.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListApprovalsQuery {
    /// `pending` (default), `approved`, `rejected`, `expired` or `all`.
    /// Matches the effective status.
    pub status: Option<String>,
    /// Maximum results (default 50, max 200).
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct ApproveRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RejectRequest {
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApprovalResponse {
    pub id: Uuid,
    pub preview_id: Uuid,
    pub source_id: Uuid,
    pub source_run_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    /// Effective status: a pending approval past `expires_at` reads as `expired`.
    pub status: String,
    pub requested_by: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub stats: SyncStats,
    #[schema(value_type = Object)]
    pub metadata: JsonValue,
}

impl From<DeactivationApproval> for ApprovalResponse {
    fn from(approval: DeactivationApproval) -> Self {
        Self {
            id: approval.id,
            preview_id: approval.preview_id,
            source_id: approval.source_id,
            source_run_id: approval.source_run_id,
            school_id: approval.school_id,
            district_id: approval.district_id,
            status: approval.status.as_str().to_string(),
            requested_by: approval.requested_by,
            requested_at: approval.requested_at,
            decided_by: approval.decided_by,
            decided_at: approval.decided_at,
            decision_reason: approval.decision_reason,
            applied_at: approval.applied_at,
            expires_at: approval.expires_at,
            stats: approval.stats,
            metadata: approval.metadata,
        }
    }
}

/// Approval with the preview it gates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApprovalDetailResponse {
    #[serde(flatten)]
    pub approval: ApprovalResponse,
    pub preview: Option<PreviewResponse>,
}

impl TryFrom<ApprovalDetail> for ApprovalDetailResponse {
    type Error = ApiError;

    fn try_from(detail: ApprovalDetail) -> Result<Self, Self::Error> {
        Ok(Self {
            approval: detail.approval.into(),
            preview: detail.preview.map(PreviewResponse::try_from).transpose()?,
        })
    }
}

/// Outcome of an approve or reject call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DecisionResponse {
    pub ok: bool,
    pub approval_id: Uuid,
    pub status: String,
}

impl From<DeactivationApproval> for DecisionResponse {
    fn from(approval: DeactivationApproval) -> Self {
        Self {
            ok: true,
            approval_id: approval.id,
            status: approval.status.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplyResponse {
    pub ok: bool,
    pub approval_id: Option<Uuid>,
    pub preview_id: Uuid,
    pub job_id: Uuid,
    /// `applied` or `partially_applied`.
    pub status: String,
    pub upserted: u32,
    pub deactivated: u32,
    #[schema(value_type = Vec<Object>)]
    pub apply_errors: Vec<ApplyItemError>,
    pub apply_errors_truncated: u32,
    pub applied_at: DateTime<Utc>,
    /// `true` when the cached result of an earlier apply is returned.
    pub replayed: bool,
}

impl From<ApplyResult> for ApplyResponse {
    fn from(result: ApplyResult) -> Self {
        Self {
            ok: result.ok,
            approval_id: result.approval_id,
            preview_id: result.preview_id,
            job_id: result.job_id,
            status: result.status.as_str().to_string(),
            upserted: result.upserted,
            deactivated: result.deactivated,
            apply_errors: result.apply_errors,
            apply_errors_truncated: result.apply_errors_truncated,
            applied_at: result.applied_at,
            replayed: result.replayed,
        }
    }
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OpsSummaryResponse {
    pub sources_total: u32,
    pub sources_enabled: u32,
    #[schema(value_type = Object)]
    pub runs_by_status: BTreeMap<String, u32>,
    #[schema(value_type = Object)]
    pub approvals_by_status: BTreeMap<String, u32>,
    pub previews_total: u32,
    pub previews_applied: u32,
    pub applied_upserts: u64,
    pub applied_deactivations: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl From<OpsSummary> for OpsSummaryResponse {
    fn from(summary: OpsSummary) -> Self {
        Self {
            sources_total: summary.sources_total,
            sources_enabled: summary.sources_enabled,
            runs_by_status: summary.runs_by_status,
            approvals_by_status: summary.approvals_by_status,
            previews_total: summary.previews_total,
            previews_applied: summary.previews_applied,
            applied_upserts: summary.applied_upserts,
            applied_deactivations: summary.applied_deactivations,
            last_run_at: summary.last_run_at,
        }
    }
}

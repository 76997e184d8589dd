//! Deactivation approval handlers.
//!
//! - GET  /directory/approvals - List approvals by effective status (default pending)
//! - GET  /directory/approvals/:id - Approval with its preview
//! - POST /directory/approvals/:id/approve
//! - POST /directory/approvals/:id/reject
//! - POST /directory/approvals/:id/apply - Apply an approved preview

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Extension, Json,
};
use uuid::Uuid;
use validator::Validate;
use xavyo_directory_sync::{Actor, ApprovalStatus};

use crate::error::{ApiError, ApiResult, ProblemDetails};
use crate::handlers::optional_json;
use crate::models::{
    ApplyResponse, ApprovalDetailResponse, ApprovalResponse, ApproveRequest, DecisionResponse,
    ListApprovalsQuery, RejectRequest,
};
use crate::router::DirectorySyncState;

#[utoipa::path(
    get,
    path = "/directory/approvals",
    tag = "Directory Sync",
    operation_id = "listDeactivationApprovals",
    params(ListApprovalsQuery),
    responses(
        (status = 200, description = "Approvals, newest first", body = Vec<ApprovalResponse>),
        (status = 400, description = "Unknown status filter", body = ProblemDetails)
    )
)]
pub async fn list_approvals(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<ListApprovalsQuery>,
) -> ApiResult<Json<Vec<ApprovalResponse>>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => Some(ApprovalStatus::Pending),
        Some("all") => None,
        Some(raw) => Some(raw.parse::<ApprovalStatus>().map_err(ApiError::Validation)?),
    };

    let approvals = state
        .service
        .list_approvals(&actor, status, query.limit)
        .await?;
    Ok(Json(approvals.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/directory/approvals/{id}",
    tag = "Directory Sync",
    operation_id = "getDeactivationApproval",
    params(("id" = Uuid, Path, description = "Approval ID")),
    responses(
        (status = 200, description = "Approval and its preview", body = ApprovalDetailResponse),
        (status = 404, description = "Approval not found", body = ProblemDetails)
    )
)]
pub async fn get_approval(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(approval_id): Path<Uuid>,
) -> ApiResult<Json<ApprovalDetailResponse>> {
    let detail = state.service.get_approval(&actor, approval_id).await?;
    Ok(Json(detail.try_into()?))
}

#[utoipa::path(
    post,
    path = "/directory/approvals/{id}/approve",
    tag = "Directory Sync",
    operation_id = "approveDeactivations",
    params(("id" = Uuid, Path, description = "Approval ID")),
    request_body(content = ApproveRequest, description = "Optional decision note"),
    responses(
        (status = 200, description = "Approved (idempotent)", body = DecisionResponse),
        (status = 404, description = "Approval not found", body = ProblemDetails),
        (status = 409, description = "Approval already rejected", body = ProblemDetails),
        (status = 410, description = "Approval expired", body = ProblemDetails)
    )
)]
pub async fn approve(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(approval_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<DecisionResponse>> {
    let req = optional_json::<ApproveRequest>(&body)?.unwrap_or_default();
    req.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let approval = state
        .service
        .approve(&actor, approval_id, req.reason)
        .await?;
    Ok(Json(approval.into()))
}

#[utoipa::path(
    post,
    path = "/directory/approvals/{id}/reject",
    tag = "Directory Sync",
    operation_id = "rejectDeactivations",
    params(("id" = Uuid, Path, description = "Approval ID")),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Rejected (idempotent)", body = DecisionResponse),
        (status = 400, description = "Reason missing", body = ProblemDetails),
        (status = 404, description = "Approval not found", body = ProblemDetails),
        (status = 409, description = "Approval already approved", body = ProblemDetails),
        (status = 410, description = "Approval expired", body = ProblemDetails)
    )
)]
pub async fn reject(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(approval_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<DecisionResponse>> {
    let req = optional_json::<RejectRequest>(&body)?
        .ok_or_else(|| ApiError::Validation("a rejection reason is required".to_string()))?;
    req.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let approval = state
        .service
        .reject(&actor, approval_id, &req.reason)
        .await?;
    Ok(Json(approval.into()))
}

#[utoipa::path(
    post,
    path = "/directory/approvals/{id}/apply",
    tag = "Directory Sync",
    operation_id = "applyApprovedPreview",
    params(("id" = Uuid, Path, description = "Approval ID")),
    responses(
        (status = 200, description = "Applied, or the cached result of an earlier apply", body = ApplyResponse),
        (status = 404, description = "Approval not found", body = ProblemDetails),
        (status = 409, description = "Not approved yet, or another apply is running", body = ProblemDetails),
        (status = 410, description = "Approval expired", body = ProblemDetails)
    )
)]
pub async fn apply(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(approval_id): Path<Uuid>,
) -> ApiResult<Json<ApplyResponse>> {
    let result = state.service.apply(&actor, approval_id).await?;
    Ok(Json(result.into()))
}

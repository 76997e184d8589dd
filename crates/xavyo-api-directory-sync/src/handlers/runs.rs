//! Run and preview handlers.
//!
//! - GET  /directory/sources/:id/runs - Run history for a source
//! - GET  /directory/runs/:id - Get a run
//! - GET  /directory/previews/:id - Get a preview
//! - POST /directory/previews/:id/apply - Apply a preview that needs no approval

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use uuid::Uuid;
use xavyo_directory_sync::Actor;

use crate::error::{ApiResult, ProblemDetails};
use crate::models::{ApplyResponse, ListRunsQuery, PreviewResponse, RunResponse};
use crate::router::DirectorySyncState;

#[utoipa::path(
    get,
    path = "/directory/sources/{id}/runs",
    tag = "Directory Sync",
    operation_id = "listSourceRuns",
    params(("id" = Uuid, Path, description = "Source ID"), ListRunsQuery),
    responses(
        (status = 200, description = "Runs, newest first", body = Vec<RunResponse>),
        (status = 404, description = "Source not found", body = ProblemDetails)
    )
)]
pub async fn list_runs(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(source_id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunResponse>>> {
    let runs = state
        .service
        .list_runs(&actor, source_id, query.limit)
        .await?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/directory/runs/{id}",
    tag = "Directory Sync",
    operation_id = "getSourceRun",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run", body = RunResponse),
        (status = 404, description = "Run not found", body = ProblemDetails)
    )
)]
pub async fn get_run(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunResponse>> {
    let run = state.service.get_run(&actor, run_id).await?;
    Ok(Json(run.into()))
}

#[utoipa::path(
    get,
    path = "/directory/previews/{id}",
    tag = "Directory Sync",
    operation_id = "getSyncPreview",
    params(("id" = Uuid, Path, description = "Preview ID")),
    responses(
        (status = 200, description = "Preview", body = PreviewResponse),
        (status = 404, description = "Preview not found", body = ProblemDetails)
    )
)]
pub async fn get_preview(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(preview_id): Path<Uuid>,
) -> ApiResult<Json<PreviewResponse>> {
    let preview = state.service.get_preview(&actor, preview_id).await?;
    Ok(Json(preview.try_into()?))
}

/// Apply a preview directly. Previews gated by an approval must go through
/// the approval's apply endpoint instead.
#[utoipa::path(
    post,
    path = "/directory/previews/{id}/apply",
    tag = "Directory Sync",
    operation_id = "applySyncPreview",
    params(("id" = Uuid, Path, description = "Preview ID")),
    responses(
        (status = 200, description = "Applied, or the cached result of an earlier apply", body = ApplyResponse),
        (status = 404, description = "Preview not found", body = ProblemDetails),
        (status = 409, description = "Preview needs approval, is a dry run, or is being applied", body = ProblemDetails),
        (status = 410, description = "Preview expired", body = ProblemDetails)
    )
)]
pub async fn apply_preview(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(preview_id): Path<Uuid>,
) -> ApiResult<Json<ApplyResponse>> {
    let result = state.service.apply_preview(&actor, preview_id).await?;
    Ok(Json(result.into()))
}

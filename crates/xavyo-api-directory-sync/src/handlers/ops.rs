//! GET /directory/ops/summary

use axum::{extract::State, Extension, Json};
use xavyo_directory_sync::Actor;

use crate::error::{ApiResult, ProblemDetails};
use crate::models::OpsSummaryResponse;
use crate::router::DirectorySyncState;

#[utoipa::path(
    get,
    path = "/directory/ops/summary",
    tag = "Directory Sync",
    operation_id = "getDirectorySyncSummary",
    responses(
        (status = 200, description = "Aggregate counts for the caller's scope", body = OpsSummaryResponse),
        (status = 401, description = "Missing actor context", body = ProblemDetails)
    )
)]
pub async fn get_ops_summary(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Json<OpsSummaryResponse>> {
    let summary = state.service.get_ops_summary(&actor).await?;
    Ok(Json(summary.into()))
}

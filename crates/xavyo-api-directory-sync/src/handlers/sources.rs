//! Directory source handlers.
//!
//! - POST /directory/sources - Register a source
//! - GET  /directory/sources - List sources in scope
//! - GET  /directory/sources/:id - Get a source
//! - POST /directory/sources/:id/enable, /disable - Toggle a source
//! - POST /directory/sources/:id/sync - Run a sync and produce a preview

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;
use validator::Validate;
use xavyo_directory_sync::Actor;

use crate::error::{ApiError, ApiResult, ProblemDetails};
use crate::handlers::optional_json;
use crate::models::{CreateSourceRequest, SourceResponse, SyncSourceRequest, SyncSourceResponse};
use crate::router::DirectorySyncState;

#[utoipa::path(
    post,
    path = "/directory/sources",
    tag = "Directory Sync",
    operation_id = "createDirectorySource",
    request_body = CreateSourceRequest,
    responses(
        (status = 201, description = "Source registered", body = SourceResponse),
        (status = 400, description = "Invalid source definition", body = ProblemDetails),
        (status = 401, description = "Missing actor context", body = ProblemDetails)
    )
)]
pub async fn create_source(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateSourceRequest>,
) -> ApiResult<(StatusCode, Json<SourceResponse>)> {
    req.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let source = state
        .service
        .create_source(&actor, req.into_input())
        .await?;
    Ok((StatusCode::CREATED, Json(source.into())))
}

#[utoipa::path(
    get,
    path = "/directory/sources",
    tag = "Directory Sync",
    operation_id = "listDirectorySources",
    responses(
        (status = 200, description = "Sources in the caller's scope", body = Vec<SourceResponse>),
        (status = 401, description = "Missing actor context", body = ProblemDetails)
    )
)]
pub async fn list_sources(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Json<Vec<SourceResponse>>> {
    let sources = state.service.list_sources(&actor).await?;
    Ok(Json(sources.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/directory/sources/{id}",
    tag = "Directory Sync",
    operation_id = "getDirectorySource",
    params(("id" = Uuid, Path, description = "Source ID")),
    responses(
        (status = 200, description = "Source", body = SourceResponse),
        (status = 404, description = "Source not found", body = ProblemDetails)
    )
)]
pub async fn get_source(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(source_id): Path<Uuid>,
) -> ApiResult<Json<SourceResponse>> {
    let source = state.service.get_source(&actor, source_id).await?;
    Ok(Json(source.into()))
}

#[utoipa::path(
    post,
    path = "/directory/sources/{id}/enable",
    tag = "Directory Sync",
    operation_id = "enableDirectorySource",
    params(("id" = Uuid, Path, description = "Source ID")),
    responses(
        (status = 200, description = "Source enabled", body = SourceResponse),
        (status = 404, description = "Source not found", body = ProblemDetails)
    )
)]
pub async fn enable_source(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(source_id): Path<Uuid>,
) -> ApiResult<Json<SourceResponse>> {
    let source = state
        .service
        .set_source_enabled(&actor, source_id, true)
        .await?;
    Ok(Json(source.into()))
}

#[utoipa::path(
    post,
    path = "/directory/sources/{id}/disable",
    tag = "Directory Sync",
    operation_id = "disableDirectorySource",
    params(("id" = Uuid, Path, description = "Source ID")),
    responses(
        (status = 200, description = "Source disabled", body = SourceResponse),
        (status = 404, description = "Source not found", body = ProblemDetails)
    )
)]
pub async fn disable_source(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(source_id): Path<Uuid>,
) -> ApiResult<Json<SourceResponse>> {
    let source = state
        .service
        .set_source_enabled(&actor, source_id, false)
        .await?;
    Ok(Json(source.into()))
}

/// Run a sync for the source. An empty body is a plain run that does not
/// propose deactivations.
#[utoipa::path(
    post,
    path = "/directory/sources/{id}/sync",
    tag = "Directory Sync",
    operation_id = "syncDirectorySource",
    params(("id" = Uuid, Path, description = "Source ID")),
    request_body(content = SyncSourceRequest, description = "Optional sync options"),
    responses(
        (status = 200, description = "Run finished with a preview", body = SyncSourceResponse),
        (status = 404, description = "Source not found", body = ProblemDetails),
        (status = 409, description = "Source disabled or a run is already active", body = ProblemDetails),
        (status = 502, description = "Source feed unreachable", body = ProblemDetails),
        (status = 504, description = "Source feed timed out", body = ProblemDetails)
    )
)]
pub async fn sync_source(
    State(state): State<DirectorySyncState>,
    Extension(actor): Extension<Actor>,
    Path(source_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<SyncSourceResponse>> {
    let options = optional_json::<SyncSourceRequest>(&body)?.unwrap_or_default();

    let result = state
        .service
        .sync_source(&actor, source_id, options.into())
        .await?;
    Ok(Json(result.into()))
}

//! Router and state for the directory sync API.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use xavyo_directory_sync::DirectorySyncService;

use crate::error::ProblemDetails;
use crate::handlers;
use crate::middleware::actor_context_middleware;
use crate::models::{
    ApplyResponse, ApprovalDetailResponse, ApprovalResponse, ApproveRequest,
    CreateSourceRequest, DecisionResponse, OpsSummaryResponse, PreviewResponse, RejectRequest,
    RunResponse, SourceResponse, SyncSourceRequest, SyncSourceResponse,
};

/// Shared state for directory sync routes.
#[derive(Clone)]
pub struct DirectorySyncState {
    pub service: DirectorySyncService,
}

impl DirectorySyncState {
    #[must_use]
    pub fn new(service: DirectorySyncService) -> Self {
        Self { service }
    }
}

/// Create the directory sync router.
///
/// Every route requires the actor context headers:
/// - POST /directory/sources                    - Register a source
/// - GET  /directory/sources                    - List sources
/// - GET  /directory/sources/:id                - Get a source
/// - POST /directory/sources/:id/enable         - Enable a source
/// - POST /directory/sources/:id/disable        - Disable a source
/// - POST /directory/sources/:id/sync           - Run a sync
/// - GET  /directory/sources/:id/runs           - Run history
/// - GET  /directory/runs/:id                   - Get a run
/// - GET  /directory/previews/:id               - Get a preview
/// - POST /directory/previews/:id/apply         - Apply an ungated preview
/// - GET  /directory/approvals                  - List approvals
/// - GET  /directory/approvals/:id              - Approval with preview
/// - POST /directory/approvals/:id/approve      - Approve deactivations
/// - POST /directory/approvals/:id/reject       - Reject deactivations
/// - POST /directory/approvals/:id/apply        - Apply an approved preview
/// - GET  /directory/ops/summary                - Aggregate counts
pub fn directory_sync_router(state: DirectorySyncState) -> Router {
    Router::new()
        // Sources
        .route(
            "/directory/sources",
            get(handlers::sources::list_sources).post(handlers::sources::create_source),
        )
        .route("/directory/sources/:id", get(handlers::sources::get_source))
        .route(
            "/directory/sources/:id/enable",
            post(handlers::sources::enable_source),
        )
        .route(
            "/directory/sources/:id/disable",
            post(handlers::sources::disable_source),
        )
        .route(
            "/directory/sources/:id/sync",
            post(handlers::sources::sync_source),
        )
        // Runs and previews
        .route(
            "/directory/sources/:id/runs",
            get(handlers::runs::list_runs),
        )
        .route("/directory/runs/:id", get(handlers::runs::get_run))
        .route("/directory/previews/:id", get(handlers::runs::get_preview))
        .route(
            "/directory/previews/:id/apply",
            post(handlers::runs::apply_preview),
        )
        // Approvals
        .route(
            "/directory/approvals",
            get(handlers::approvals::list_approvals),
        )
        .route(
            "/directory/approvals/:id",
            get(handlers::approvals::get_approval),
        )
        .route(
            "/directory/approvals/:id/approve",
            post(handlers::approvals::approve),
        )
        .route(
            "/directory/approvals/:id/reject",
            post(handlers::approvals::reject),
        )
        .route(
            "/directory/approvals/:id/apply",
            post(handlers::approvals::apply),
        )
        // Ops
        .route(
            "/directory/ops/summary",
            get(handlers::ops::get_ops_summary),
        )
        .layer(middleware::from_fn(actor_context_middleware))
        .with_state(state)
}

/// `OpenAPI` document for the directory sync routes.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "xavyo Directory Sync API",
        description = "Directory source reconciliation with approval-gated deactivation"
    ),
    paths(
        handlers::sources::create_source,
        handlers::sources::list_sources,
        handlers::sources::get_source,
        handlers::sources::enable_source,
        handlers::sources::disable_source,
        handlers::sources::sync_source,
        handlers::runs::list_runs,
        handlers::runs::get_run,
        handlers::runs::get_preview,
        handlers::runs::apply_preview,
        handlers::approvals::list_approvals,
        handlers::approvals::get_approval,
        handlers::approvals::approve,
        handlers::approvals::reject,
        handlers::approvals::apply,
        handlers::ops::get_ops_summary,
    ),
    components(schemas(
        ProblemDetails,
        CreateSourceRequest,
        SourceResponse,
        SyncSourceRequest,
        SyncSourceResponse,
        RunResponse,
        PreviewResponse,
        ApprovalResponse,
        ApprovalDetailResponse,
        ApproveRequest,
        RejectRequest,
        DecisionResponse,
        ApplyResponse,
        OpsSummaryResponse,
    )),
    tags((name = "Directory Sync", description = "Roster sync runs, previews, approvals and apply"))
)]
pub struct DirectorySyncApiDoc;

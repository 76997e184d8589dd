//! Actor context middleware.
//!
//! The gateway in front of this service authenticates the caller and
//! forwards the resolved identity as headers. This middleware turns them
//! into an [`Actor`] request extension for the handlers.

use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;
use xavyo_directory_sync::{Actor, Scope};

use crate::error::ApiError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const SCHOOL_ID_HEADER: &str = "x-school-id";
pub const DISTRICT_ID_HEADER: &str = "x-district-id";

/// Insert the calling [`Actor`] into request extensions.
///
/// `X-Actor-Id` is required, as is at least one of `X-School-Id` and
/// `X-District-Id`. Anything missing or malformed is a 401.
pub async fn actor_context_middleware(
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let actor = actor_from_headers(request.headers())?;
    tracing::debug!(
        actor_id = ?actor.actor_id,
        scope = %actor.scope,
        "Resolved directory sync actor"
    );
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let actor_id = uuid_header(headers, ACTOR_ID_HEADER)?
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ID_HEADER} header")))?;
    let scope = Scope::new(
        uuid_header(headers, SCHOOL_ID_HEADER)?,
        uuid_header(headers, DISTRICT_ID_HEADER)?,
    );
    if !scope.is_valid() {
        return Err(ApiError::Unauthorized(format!(
            "one of {SCHOOL_ID_HEADER} or {DISTRICT_ID_HEADER} is required"
        )));
    }
    Ok(Actor::new(actor_id, scope))
}

fn uuid_header(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, ApiError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized(format!("{name} is not valid text")))?
        .trim();
    if value.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| ApiError::Unauthorized(format!("{name} is not a valid UUID")))
}

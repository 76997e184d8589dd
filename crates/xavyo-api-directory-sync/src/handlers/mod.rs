//! HTTP handlers for directory sync endpoints.

pub mod approvals;
pub mod ops;
pub mod runs;
pub mod sources;

use axum::body::Bytes;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// Parse an optional JSON body. An empty body yields `None`.
pub(crate) fn optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::Validation(format!("invalid JSON body: {e}")))
}

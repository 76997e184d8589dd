//! Error types for the directory sync API.
//!
//! Uses RFC 7807 Problem Details for HTTP APIs. The problem type URI ends
//! with the stable machine code of the underlying error, which is also
//! repeated in the `code` member.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use xavyo_directory_sync::DirectorySyncError;

/// Base URL for error type URIs.
const ERROR_BASE_URL: &str = "https://xavyo.net/errors/directory-sync";

/// RFC 7807 Problem Details structure.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    /// URI identifying the problem type.
    #[serde(rename = "type")]
    pub error_type: String,

    /// Short human-readable summary.
    pub title: String,

    /// HTTP status code.
    pub status: u16,

    /// Stable machine-readable code.
    pub code: String,

    /// Human-readable explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProblemDetails {
    #[must_use]
    pub fn new(code: &str, title: &str, status: StatusCode) -> Self {
        Self {
            error_type: format!("{ERROR_BASE_URL}/{code}"),
            title: title.to_string(),
            status: status.as_u16(),
            code: code.to_string(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Directory sync API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Error raised by the sync service.
    #[error(transparent)]
    Sync(#[from] DirectorySyncError),

    /// Request body or query failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Actor context headers missing or malformed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Sync(err) => sync_status(err),
        }
    }

    /// Stable machine code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Sync(err) => err.code(),
        }
    }

    /// Convert to `ProblemDetails`.
    ///
    /// Internal failures get a generic detail; the cause is logged instead.
    pub fn to_problem_details(&self) -> ProblemDetails {
        let status = self.status_code();
        let problem = ProblemDetails::new(self.code(), title_for(self), status);
        match self {
            ApiError::Sync(err) if err.is_internal() => {
                tracing::error!(code = err.code(), error = %err, "Directory sync internal error");
                problem.with_detail("An internal error occurred")
            }
            other => problem.with_detail(other.to_string()),
        }
    }
}

fn sync_status(err: &DirectorySyncError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_conflict() => StatusCode::CONFLICT,
        DirectorySyncError::ApprovalExpired { .. } | DirectorySyncError::PreviewExpired { .. } => {
            StatusCode::GONE
        }
        DirectorySyncError::Validation(_) => StatusCode::BAD_REQUEST,
        DirectorySyncError::AdapterUnreachable { .. } => StatusCode::BAD_GATEWAY,
        DirectorySyncError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn title_for(err: &ApiError) -> &'static str {
    match err {
        ApiError::Validation(_) => "Validation Failed",
        ApiError::Unauthorized(_) => "Unauthorized",
        ApiError::Sync(err) => match err {
            DirectorySyncError::SourceNotFound { .. } => "Source Not Found",
            DirectorySyncError::RunNotFound { .. } => "Run Not Found",
            DirectorySyncError::PreviewNotFound { .. } => "Preview Not Found",
            DirectorySyncError::ApprovalNotFound { .. } => "Approval Not Found",
            DirectorySyncError::SourceDisabled { .. } => "Source Disabled",
            DirectorySyncError::RunInProgress { .. } => "Sync In Progress",
            DirectorySyncError::ApprovalClosed { .. } => "Approval Closed",
            DirectorySyncError::ApprovalExpired { .. } => "Approval Expired",
            DirectorySyncError::ApprovalNotApproved { .. } => "Approval Not Approved",
            DirectorySyncError::ApplyInProgress { .. } => "Apply In Progress",
            DirectorySyncError::PreviewExpired { .. } => "Preview Expired",
            DirectorySyncError::PreviewNotApplicable { .. } => "Preview Not Applicable",
            DirectorySyncError::AdapterUnreachable { .. } => "Source Unreachable",
            DirectorySyncError::Timeout { .. } => "Source Timeout",
            DirectorySyncError::Validation(_) => "Validation Failed",
            DirectorySyncError::Store(_)
            | DirectorySyncError::Serialization(_)
            | DirectorySyncError::Internal(_) => "Internal Server Error",
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let problem = self.to_problem_details();

        let mut response = (status, Json(problem)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use xavyo_directory_sync::{ApprovalStatus, StoreError};

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (
                DirectorySyncError::ApprovalNotFound { approval_id: id },
                StatusCode::NOT_FOUND,
            ),
            (
                DirectorySyncError::ApprovalClosed {
                    approval_id: id,
                    status: ApprovalStatus::Rejected,
                },
                StatusCode::CONFLICT,
            ),
            (
                DirectorySyncError::ApplyInProgress {
                    preview_id: id,
                    job_id: id,
                },
                StatusCode::CONFLICT,
            ),
            (
                DirectorySyncError::PreviewExpired {
                    preview_id: id,
                    expires_at: Utc::now(),
                },
                StatusCode::GONE,
            ),
            (
                DirectorySyncError::AdapterUnreachable {
                    source_type: "csv".into(),
                    message: "gone".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DirectorySyncError::Timeout {
                    source_id: id,
                    timeout_secs: 5,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DirectorySyncError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_problem_details_carry_code() {
        let problem = ApiError::from(DirectorySyncError::RunInProgress {
            source_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
        })
        .to_problem_details();

        assert_eq!(
            problem.error_type,
            "https://xavyo.net/errors/directory-sync/run_in_progress"
        );
        assert_eq!(problem.code, "run_in_progress");
        assert_eq!(problem.status, 409);
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = ApiError::from(DirectorySyncError::Store(StoreError::Internal(
            "connection reset by peer".into(),
        )));
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 500);
        assert_eq!(problem.detail.as_deref(), Some("An internal error occurred"));
    }
}

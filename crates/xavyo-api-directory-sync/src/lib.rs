//! Directory Sync REST API.
//!
//! This crate exposes [`xavyo_directory_sync::DirectorySyncService`] over HTTP:
//! - Source registration, enable/disable and manual sync runs
//! - Run history and previews
//! - Deactivation approvals (approve, reject, apply)
//! - An ops summary for dashboards
//!
//! Callers are identified by gateway-forwarded headers (`X-Actor-Id`,
//! `X-School-Id`, `X-District-Id`); errors are RFC 7807 problem documents.
//!
//! # Example
//!
//! ```rust,ignore
//! use xavyo_api_directory_sync::{directory_sync_router, DirectorySyncState};
//!
//! let state = DirectorySyncState::new(service);
//! let app = axum::Router::new().merge(directory_sync_router(state));
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod router;

pub use error::{ApiError, ApiResult, ProblemDetails};
pub use middleware::actor_context_middleware;
pub use router::{directory_sync_router, DirectorySyncApiDoc, DirectorySyncState};

//! # Directory Sync
//!
//! Reconciles upstream staff/student directory feeds against canonical
//! records for a school or district.
//!
//! A sync fetches and normalizes a source's feed, diffs it against the
//! current records and persists an immutable preview. Previews that propose
//! deactivations must pass a human approval before they are applied; apply
//! happens at most once per preview.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────────┐
//! │ Normalizer │──►│ Orchestrator│──►│  Preview  │──►│ Approval Gate│
//! │ (csv/http) │   │  + Diff     │   │ (stored)  │   │              │
//! └────────────┘   └─────────────┘   └─────┬─────┘   └──────┬───────┘
//!                                          │                │
//!                                          ▼                ▼
//!                                    ┌──────────────────────────┐
//!                                    │      Apply Executor      │
//!                                    │  (canonical store write) │
//!                                    └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xavyo_directory_sync::{Actor, DirectorySyncService, InMemoryDirectoryStore, SyncOptions};
//!
//! let store = Arc::new(InMemoryDirectoryStore::new());
//! let service = DirectorySyncService::builder(store.clone(), store).build();
//!
//! let result = service
//!     .sync_source(&actor, source_id, SyncOptions { deactivate_missing: true, dry_run: false })
//!     .await?;
//! if let Some(approval_id) = result.approval_id {
//!     service.approve(&reviewer, approval_id, None).await?;
//!     service.apply(&reviewer, approval_id).await?;
//! }
//! ```

pub mod apply;
pub mod approval;
pub mod audit;
pub mod clock;
pub mod config;
pub mod diff;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod scheduler;
pub mod service;
pub mod statistics;
pub mod store;
pub mod types;

pub use apply::{ApplyExecutor, ApplyItemError, ApplyOperation, ApplyResult, ApplyStatus};
pub use approval::{ApprovalDecision, ApprovalGate};
pub use audit::{
    AuditAction, AuditEntity, AuditError, AuditEvent, AuditSink, InMemoryAuditSink, PgAuditSink,
    TracingAuditSink,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DirectorySyncConfig};
pub use diff::{
    compute_diff, AddItem, DeactivationCandidate, Diff, DiffOptions, DiffOutcome, FieldChange,
    UpdateItem,
};
pub use error::{DirectorySyncError, DirectorySyncResult};
pub use models::{
    ApprovalTransition, CanonicalRecord, CreateDirectorySource, DeactivationApproval,
    DirectorySource, OpsSummary, Preview, RecordUpsert, RunFinish, SourceRun, SyncOptions,
    SyncSchedule,
};
pub use normalizer::{
    CsvNormalizer, FeedUrlPolicy, HttpJsonNormalizer, InlineNormalizer, NormalizedRow, Normalizer,
    NormalizerError, NormalizerRegistry,
};
pub use orchestrator::{requires_approval, RunOrchestrator, SyncSourceResult};
pub use scheduler::{
    CronSchedule, ScheduleError, ScheduleTimezone, ScheduledRunReport, SyncScheduler,
};
pub use service::{ApprovalDetail, DirectorySyncService, DirectorySyncServiceBuilder};
pub use statistics::{RowError, RowErrorReason, SyncStats};
pub use store::{
    run_migrations, CanonicalStore, InMemoryDirectoryStore, PgDirectoryStore, StoreError,
    StoreResult, SyncStore,
};
pub use types::{Actor, ApprovalStatus, RecordType, RunStatus, Scope};

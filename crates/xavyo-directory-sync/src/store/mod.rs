//! Persistence traits and implementations.
//!
//! [`SyncStore`] owns sources, runs, previews and approvals; every
//! compare-and-set the pipeline depends on lives behind it so both backends
//! give the same guarantees. [`CanonicalStore`] owns the directory records
//! that applies write into.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::apply::ApplyResult;
use crate::models::{
    ApprovalTransition, CanonicalRecord, DeactivationApproval, DirectorySource, OpsSummary,
    Preview, RecordUpsert, RunFinish, SourceRun,
};
use crate::types::{ApprovalStatus, RecordType, Scope};

pub use memory::InMemoryDirectoryStore;
pub use postgres::{run_migrations, PgDirectoryStore};

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// A uniqueness or state constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result alias for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the atomic create-if-idle run insert.
#[derive(Debug, Clone, PartialEq)]
pub enum RunAdmission {
    Admitted(SourceRun),
    /// A queued or running run already exists.
    InProgress { run_id: Uuid },
}

/// Outcome of trying to take the apply claim on a preview.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyClaim {
    /// The caller now holds the claim.
    Claimed(Preview),
    /// The preview was applied before; replay its cached result.
    AlreadyApplied(Preview),
    /// A live claim is held by another job.
    InProgress { job_id: Uuid },
    NotFound,
}

/// Listing filter for approvals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalFilter {
    /// Match on effective status.
    pub status: Option<ApprovalStatus>,
    pub limit: usize,
    /// Reference time for effective-status evaluation.
    pub now: DateTime<Utc>,
}

/// Final write of an apply: result cached on the preview, `applied_at` on both records.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyCompletion {
    pub preview_id: Uuid,
    pub approval_id: Option<Uuid>,
    pub job_id: Uuid,
    pub result: ApplyResult,
}

/// Sources, runs, previews and approvals.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn insert_source(&self, source: &DirectorySource) -> StoreResult<()>;

    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<DirectorySource>>;

    /// Sources inside `scope`, oldest first.
    async fn list_sources(&self, scope: &Scope) -> StoreResult<Vec<DirectorySource>>;

    /// Enabled sources that carry a schedule, across every scope.
    async fn list_scheduled_sources(&self) -> StoreResult<Vec<DirectorySource>>;

    async fn set_source_enabled(
        &self,
        source_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DirectorySource>>;

    /// Fail queued or running runs of `source_id` that started before
    /// `stale_before`, releasing the one-active-run slot. Returns their ids.
    async fn fail_abandoned_runs(
        &self,
        source_id: Uuid,
        stale_before: DateTime<Utc>,
        finish: &RunFinish,
    ) -> StoreResult<Vec<Uuid>>;

    /// Insert `run` unless the source already has a queued or running run.
    async fn try_insert_run(&self, run: &SourceRun) -> StoreResult<RunAdmission>;

    /// `queued -> running`.
    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()>;

    /// Write the terminal state of a run and stamp the source's `last_run_at`.
    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<()>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<SourceRun>>;

    /// Runs of a source, newest first.
    async fn list_runs(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SourceRun>>;

    /// Persist a preview and, when gated, its approval in one atomic write.
    async fn insert_preview(
        &self,
        preview: &Preview,
        approval: Option<&DeactivationApproval>,
    ) -> StoreResult<()>;

    async fn get_preview(&self, preview_id: Uuid) -> StoreResult<Option<Preview>>;

    async fn get_approval(&self, approval_id: Uuid) -> StoreResult<Option<DeactivationApproval>>;

    /// Approvals inside `scope`, newest first, as stored (not effective) status.
    async fn list_approvals(
        &self,
        scope: &Scope,
        filter: &ApprovalFilter,
    ) -> StoreResult<Vec<DeactivationApproval>>;

    /// Compare-and-set out of `pending`. `None` when the approval was no longer pending.
    async fn transition_approval(
        &self,
        approval_id: Uuid,
        transition: &ApprovalTransition,
    ) -> StoreResult<Option<DeactivationApproval>>;

    /// Take the apply claim unless the preview is applied or a claim newer
    /// than `stale_before` is held.
    async fn claim_preview_apply(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ApplyClaim>;

    /// Refresh `apply_claimed_at` for a running apply. Returns `false` if
    /// `job_id` no longer holds the claim.
    async fn renew_apply_claim(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Finish an apply. Returns `false` if `job_id` no longer holds the claim.
    async fn complete_preview_apply(&self, completion: &ApplyCompletion) -> StoreResult<bool>;

    async fn ops_summary(&self, scope: &Scope, now: DateTime<Utc>) -> StoreResult<OpsSummary>;
}

/// Canonical staff/student records.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Records inside `scope` with one of `record_types`, active or not.
    async fn list_records(
        &self,
        scope: &Scope,
        record_types: &[RecordType],
    ) -> StoreResult<Vec<CanonicalRecord>>;

    /// Create, or merge into the record with the same external id and
    /// record type at exactly `scope`. Always leaves the record active.
    async fn upsert_record(
        &self,
        scope: &Scope,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord>;

    /// Merge `upsert` into the record `record_id` inside `scope`, taking its
    /// record type, and reactivate it. `Conflict` when the new type collides
    /// with another record's identity.
    async fn update_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord>;

    /// Soft-deactivate. `Ok(false)` when the record was already inactive.
    async fn deactivate_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

//! Postgres store.
//!
//! Status columns are TEXT and parsed through the enums' `FromStr`; nested
//! documents (stats, diffs, apply results) are JSONB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    ApplyClaim, ApplyCompletion, ApprovalFilter, CanonicalStore, RunAdmission, StoreError,
    StoreResult, SyncStore,
};
use crate::apply::ApplyResult;
use crate::diff::Diff;
use crate::models::{
    ApprovalTransition, CanonicalRecord, DeactivationApproval, DirectorySource, OpsSummary,
    Preview, RecordUpsert, RunFinish, SourceRun, SyncSchedule,
};
use crate::statistics::{RowError, SyncStats};
use crate::types::{RecordType, RunStatus, Scope};

/// Run the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    tracing::info!("Running directory sync migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Directory sync migrations completed");
    Ok(())
}

const SOURCE_COLUMNS: &str = "id, name, school_id, district_id, source_type, config, record_types, \
     schedule, fetch_timeout_secs, enabled, last_run_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, source_id, school_id, district_id, status, dry_run, \
     deactivate_missing, triggered_by, started_at, finished_at, stats, errors, errors_truncated, \
     error_message, preview_id, created_at";

const PREVIEW_COLUMNS: &str = "id, source_id, source_run_id, school_id, district_id, diff, stats, \
     deactivate_missing, dry_run, requires_approval, approval_id, apply_job_id, apply_claimed_at, \
     apply_result, applied_at, expires_at, created_at";

const APPROVAL_COLUMNS: &str = "id, preview_id, source_id, source_run_id, school_id, district_id, \
     status, requested_by, requested_at, decided_by, decided_at, decision_reason, applied_at, \
     expires_at, stats, metadata";

const RECORD_COLUMNS: &str = "id, external_id, record_type, school_id, district_id, fields, \
     active, source_id, deactivated_at, created_at, updated_at";

/// Scope predicate; binds school then district at the given positions.
fn scope_clause(school_param: usize, district_param: usize) -> String {
    format!(
        "(${school_param}::uuid IS NULL OR school_id = ${school_param}) \
         AND (${district_param}::uuid IS NULL OR district_id = ${district_param})"
    )
}

/// Effective approval status, with pending past expiry read as expired.
fn effective_status_sql(now_param: usize) -> String {
    format!("CASE WHEN status = 'pending' AND expires_at <= ${now_param} THEN 'expired' ELSE status END")
}

fn count_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(StoreError::Internal)
}

#[derive(Debug, FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    school_id: Option<Uuid>,
    district_id: Option<Uuid>,
    source_type: String,
    config: JsonValue,
    record_types: Vec<String>,
    schedule: Option<Json<SyncSchedule>>,
    fetch_timeout_secs: Option<i64>,
    enabled: bool,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for DirectorySource {
    type Error = StoreError;

    fn try_from(row: SourceRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            school_id: row.school_id,
            district_id: row.district_id,
            source_type: row.source_type,
            config: row.config,
            record_types: row
                .record_types
                .iter()
                .map(|t| parse_column::<RecordType>(t))
                .collect::<StoreResult<_>>()?,
            schedule: row.schedule.map(|s| s.0),
            fetch_timeout_secs: row.fetch_timeout_secs.and_then(|s| u64::try_from(s).ok()),
            enabled: row.enabled,
            last_run_at: row.last_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    source_id: Uuid,
    school_id: Option<Uuid>,
    district_id: Option<Uuid>,
    status: String,
    dry_run: bool,
    deactivate_missing: bool,
    triggered_by: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stats: Json<SyncStats>,
    errors: Json<Vec<RowError>>,
    errors_truncated: i32,
    error_message: Option<String>,
    preview_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for SourceRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            source_id: row.source_id,
            school_id: row.school_id,
            district_id: row.district_id,
            status: parse_column(&row.status)?,
            dry_run: row.dry_run,
            deactivate_missing: row.deactivate_missing,
            triggered_by: row.triggered_by,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stats: row.stats.0,
            errors: row.errors.0,
            errors_truncated: u32::try_from(row.errors_truncated).unwrap_or(0),
            error_message: row.error_message,
            preview_id: row.preview_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PreviewRow {
    id: Uuid,
    source_id: Uuid,
    source_run_id: Uuid,
    school_id: Option<Uuid>,
    district_id: Option<Uuid>,
    diff: Json<Diff>,
    stats: Json<SyncStats>,
    deactivate_missing: bool,
    dry_run: bool,
    requires_approval: bool,
    approval_id: Option<Uuid>,
    apply_job_id: Option<Uuid>,
    apply_claimed_at: Option<DateTime<Utc>>,
    apply_result: Option<Json<ApplyResult>>,
    applied_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<PreviewRow> for Preview {
    fn from(row: PreviewRow) -> Self {
        Self {
            id: row.id,
            source_id: row.source_id,
            source_run_id: row.source_run_id,
            school_id: row.school_id,
            district_id: row.district_id,
            diff: row.diff.0,
            stats: row.stats.0,
            deactivate_missing: row.deactivate_missing,
            dry_run: row.dry_run,
            requires_approval: row.requires_approval,
            approval_id: row.approval_id,
            apply_job_id: row.apply_job_id,
            apply_claimed_at: row.apply_claimed_at,
            apply_result: row.apply_result.map(|r| r.0),
            applied_at: row.applied_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ApprovalRow {
    id: Uuid,
    preview_id: Uuid,
    source_id: Uuid,
    source_run_id: Uuid,
    school_id: Option<Uuid>,
    district_id: Option<Uuid>,
    status: String,
    requested_by: Option<Uuid>,
    requested_at: DateTime<Utc>,
    decided_by: Option<Uuid>,
    decided_at: Option<DateTime<Utc>>,
    decision_reason: Option<String>,
    applied_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    stats: Json<SyncStats>,
    metadata: JsonValue,
}

impl TryFrom<ApprovalRow> for DeactivationApproval {
    type Error = StoreError;

    fn try_from(row: ApprovalRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            preview_id: row.preview_id,
            source_id: row.source_id,
            source_run_id: row.source_run_id,
            school_id: row.school_id,
            district_id: row.district_id,
            status: parse_column(&row.status)?,
            requested_by: row.requested_by,
            requested_at: row.requested_at,
            decided_by: row.decided_by,
            decided_at: row.decided_at,
            decision_reason: row.decision_reason,
            applied_at: row.applied_at,
            expires_at: row.expires_at,
            stats: row.stats.0,
            metadata: row.metadata,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    external_id: String,
    record_type: String,
    school_id: Option<Uuid>,
    district_id: Option<Uuid>,
    fields: Json<Map<String, JsonValue>>,
    active: bool,
    source_id: Option<Uuid>,
    deactivated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for CanonicalRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            external_id: row.external_id,
            record_type: parse_column(&row.record_type)?,
            school_id: row.school_id,
            district_id: row.district_id,
            fields: row.fields.0,
            active: row.active,
            source_id: row.source_id,
            deactivated_at: row.deactivated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `SyncStore` and `CanonicalStore` on Postgres.
#[derive(Debug, Clone)]
pub struct PgDirectoryStore {
    pool: PgPool,
}

impl PgDirectoryStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_status(&self, run_id: Uuid) -> StoreResult<RunStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM directory_source_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some(status) => parse_column(&status),
            None => Err(StoreError::not_found("Source run", run_id)),
        }
    }
}

#[async_trait]
impl SyncStore for PgDirectoryStore {
    async fn insert_source(&self, source: &DirectorySource) -> StoreResult<()> {
        let record_types: Vec<&str> = source.record_types.iter().map(RecordType::as_str).collect();
        sqlx::query(
            r"
            INSERT INTO directory_sources (
                id, name, school_id, district_id, source_type, config, record_types,
                schedule, fetch_timeout_secs, enabled, last_run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.school_id)
        .bind(source.district_id)
        .bind(&source.source_type)
        .bind(&source.config)
        .bind(&record_types)
        .bind(source.schedule.as_ref().map(Json))
        .bind(source.fetch_timeout_secs.and_then(|s| i64::try_from(s).ok()))
        .bind(source.enabled)
        .bind(source.last_run_at)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                "Directory source {} already exists",
                source.id
            )),
            other => StoreError::Database(other),
        })?;
        Ok(())
    }

    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<DirectorySource>> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM directory_sources WHERE id = $1");
        sqlx::query_as::<_, SourceRow>(&query)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?
            .map(DirectorySource::try_from)
            .transpose()
    }

    async fn list_sources(&self, scope: &Scope) -> StoreResult<Vec<DirectorySource>> {
        if !scope.is_valid() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {SOURCE_COLUMNS} FROM directory_sources WHERE {} ORDER BY created_at, id",
            scope_clause(1, 2)
        );
        sqlx::query_as::<_, SourceRow>(&query)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DirectorySource::try_from)
            .collect()
    }

    async fn list_scheduled_sources(&self) -> StoreResult<Vec<DirectorySource>> {
        let query = format!(
            "SELECT {SOURCE_COLUMNS} FROM directory_sources \
             WHERE enabled AND schedule IS NOT NULL ORDER BY created_at, id"
        );
        sqlx::query_as::<_, SourceRow>(&query)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DirectorySource::try_from)
            .collect()
    }

    async fn set_source_enabled(
        &self,
        source_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DirectorySource>> {
        let query = format!(
            "UPDATE directory_sources SET enabled = $2, updated_at = $3 WHERE id = $1 \
             RETURNING {SOURCE_COLUMNS}"
        );
        sqlx::query_as::<_, SourceRow>(&query)
            .bind(source_id)
            .bind(enabled)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .map(DirectorySource::try_from)
            .transpose()
    }

    async fn fail_abandoned_runs(
        &self,
        source_id: Uuid,
        stale_before: DateTime<Utc>,
        finish: &RunFinish,
    ) -> StoreResult<Vec<Uuid>> {
        let reclaimed: Vec<Uuid> = sqlx::query_scalar(
            r"
            UPDATE directory_source_runs
            SET status = $3, finished_at = $4, stats = $5, errors = '[]'::jsonb,
                errors_truncated = 0, error_message = $6
            WHERE source_id = $1
              AND status IN ('queued', 'running')
              AND COALESCE(started_at, created_at) < $2
            RETURNING id
            ",
        )
        .bind(source_id)
        .bind(stale_before)
        .bind(finish.status.as_str())
        .bind(finish.finished_at)
        .bind(Json(&finish.stats))
        .bind(&finish.error_message)
        .fetch_all(&self.pool)
        .await?;
        Ok(reclaimed)
    }

    async fn try_insert_run(&self, run: &SourceRun) -> StoreResult<RunAdmission> {
        let inserted = sqlx::query(
            r"
            INSERT INTO directory_source_runs (
                id, source_id, school_id, district_id, status, dry_run, deactivate_missing,
                triggered_by, started_at, finished_at, stats, errors, errors_truncated,
                error_message, preview_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(run.id)
        .bind(run.source_id)
        .bind(run.school_id)
        .bind(run.district_id)
        .bind(run.status.as_str())
        .bind(run.dry_run)
        .bind(run.deactivate_missing)
        .bind(run.triggered_by)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(Json(&run.stats))
        .bind(Json(&run.errors))
        .bind(i32::try_from(run.errors_truncated).unwrap_or(i32::MAX))
        .bind(&run.error_message)
        .bind(run.preview_id)
        .bind(run.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(RunAdmission::Admitted(run.clone())),
            // The partial unique index admits one queued/running run per source.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let active: Option<Uuid> = sqlx::query_scalar(
                    r"
                    SELECT id FROM directory_source_runs
                    WHERE source_id = $1 AND status IN ('queued', 'running')
                    ",
                )
                .bind(run.source_id)
                .fetch_optional(&self.pool)
                .await?;
                match active {
                    Some(run_id) => Ok(RunAdmission::InProgress { run_id }),
                    None => Err(StoreError::Conflict(format!(
                        "Run admission for source {} raced with a finishing run",
                        run.source_id
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()> {
        let updated = sqlx::query(
            r"
            UPDATE directory_source_runs
            SET status = 'running', started_at = $2
            WHERE id = $1 AND status = 'queued'
            ",
        )
        .bind(run_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let status = self.run_status(run_id).await?;
            return Err(StoreError::Conflict(format!(
                "Source run {run_id} is {status}, expected queued"
            )));
        }
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let source_id: Option<Uuid> = sqlx::query_scalar(
            r"
            UPDATE directory_source_runs
            SET status = $2, finished_at = $3, stats = $4, errors = $5,
                errors_truncated = $6, error_message = $7, preview_id = $8
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING source_id
            ",
        )
        .bind(run_id)
        .bind(finish.status.as_str())
        .bind(finish.finished_at)
        .bind(Json(&finish.stats))
        .bind(Json(&finish.errors))
        .bind(i32::try_from(finish.errors_truncated).unwrap_or(i32::MAX))
        .bind(&finish.error_message)
        .bind(finish.preview_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(source_id) = source_id else {
            drop(tx);
            let status = self.run_status(run_id).await?;
            return Err(StoreError::Conflict(format!(
                "Source run {run_id} is already {status}"
            )));
        };

        sqlx::query("UPDATE directory_sources SET last_run_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(finish.finished_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<SourceRun>> {
        let query = format!("SELECT {RUN_COLUMNS} FROM directory_source_runs WHERE id = $1");
        sqlx::query_as::<_, RunRow>(&query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SourceRun::try_from)
            .transpose()
    }

    async fn list_runs(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SourceRun>> {
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM directory_source_runs WHERE source_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        sqlx::query_as::<_, RunRow>(&query)
            .bind(source_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SourceRun::try_from)
            .collect()
    }

    async fn insert_preview(
        &self,
        preview: &Preview,
        approval: Option<&DeactivationApproval>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO directory_sync_previews (
                id, source_id, source_run_id, school_id, district_id, diff, stats,
                deactivate_missing, dry_run, requires_approval, approval_id, apply_job_id,
                apply_claimed_at, apply_result, applied_at, expires_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(preview.id)
        .bind(preview.source_id)
        .bind(preview.source_run_id)
        .bind(preview.school_id)
        .bind(preview.district_id)
        .bind(Json(&preview.diff))
        .bind(Json(&preview.stats))
        .bind(preview.deactivate_missing)
        .bind(preview.dry_run)
        .bind(preview.requires_approval)
        .bind(preview.approval_id)
        .bind(preview.apply_job_id)
        .bind(preview.apply_claimed_at)
        .bind(preview.apply_result.as_ref().map(Json))
        .bind(preview.applied_at)
        .bind(preview.expires_at)
        .bind(preview.created_at)
        .execute(&mut *tx)
        .await?;

        if let Some(approval) = approval {
            sqlx::query(
                r"
                INSERT INTO directory_deactivation_approvals (
                    id, preview_id, source_id, source_run_id, school_id, district_id, status,
                    requested_by, requested_at, decided_by, decided_at, decision_reason,
                    applied_at, expires_at, stats, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ",
            )
            .bind(approval.id)
            .bind(approval.preview_id)
            .bind(approval.source_id)
            .bind(approval.source_run_id)
            .bind(approval.school_id)
            .bind(approval.district_id)
            .bind(approval.status.as_str())
            .bind(approval.requested_by)
            .bind(approval.requested_at)
            .bind(approval.decided_by)
            .bind(approval.decided_at)
            .bind(&approval.decision_reason)
            .bind(approval.applied_at)
            .bind(approval.expires_at)
            .bind(Json(&approval.stats))
            .bind(&approval.metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_preview(&self, preview_id: Uuid) -> StoreResult<Option<Preview>> {
        let query = format!("SELECT {PREVIEW_COLUMNS} FROM directory_sync_previews WHERE id = $1");
        Ok(sqlx::query_as::<_, PreviewRow>(&query)
            .bind(preview_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Preview::from))
    }

    async fn get_approval(&self, approval_id: Uuid) -> StoreResult<Option<DeactivationApproval>> {
        let query = format!(
            "SELECT {APPROVAL_COLUMNS} FROM directory_deactivation_approvals WHERE id = $1"
        );
        sqlx::query_as::<_, ApprovalRow>(&query)
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await?
            .map(DeactivationApproval::try_from)
            .transpose()
    }

    async fn list_approvals(
        &self,
        scope: &Scope,
        filter: &ApprovalFilter,
    ) -> StoreResult<Vec<DeactivationApproval>> {
        if !scope.is_valid() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {APPROVAL_COLUMNS} FROM directory_deactivation_approvals \
             WHERE {} AND ($3::text IS NULL OR {} = $3) \
             ORDER BY requested_at DESC, id DESC LIMIT $5",
            scope_clause(1, 2),
            effective_status_sql(4)
        );
        sqlx::query_as::<_, ApprovalRow>(&query)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.now)
            .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DeactivationApproval::try_from)
            .collect()
    }

    async fn transition_approval(
        &self,
        approval_id: Uuid,
        transition: &ApprovalTransition,
    ) -> StoreResult<Option<DeactivationApproval>> {
        let query = format!(
            "UPDATE directory_deactivation_approvals \
             SET status = $2, decided_by = $3, decided_at = $4, decision_reason = $5 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {APPROVAL_COLUMNS}"
        );
        sqlx::query_as::<_, ApprovalRow>(&query)
            .bind(approval_id)
            .bind(transition.to.as_str())
            .bind(transition.decided_by)
            .bind(transition.decided_at)
            .bind(&transition.reason)
            .fetch_optional(&self.pool)
            .await?
            .map(DeactivationApproval::try_from)
            .transpose()
    }

    async fn claim_preview_apply(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ApplyClaim> {
        let claim = format!(
            "UPDATE directory_sync_previews SET apply_job_id = $2, apply_claimed_at = $3 \
             WHERE id = $1 AND applied_at IS NULL \
               AND (apply_job_id IS NULL OR apply_claimed_at IS NULL OR apply_claimed_at < $4) \
             RETURNING {PREVIEW_COLUMNS}"
        );

        // A holder can finish or go away between the claim and the re-read.
        for _ in 0..3 {
            let claimed = sqlx::query_as::<_, PreviewRow>(&claim)
                .bind(preview_id)
                .bind(job_id)
                .bind(now)
                .bind(stale_before)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = claimed {
                return Ok(ApplyClaim::Claimed(row.into()));
            }

            let Some(current) = self.get_preview(preview_id).await? else {
                return Ok(ApplyClaim::NotFound);
            };
            if current.applied_at.is_some() {
                return Ok(ApplyClaim::AlreadyApplied(current));
            }
            if let Some(holder) = current.apply_job_id {
                return Ok(ApplyClaim::InProgress { job_id: holder });
            }
        }

        Err(StoreError::Conflict(format!(
            "Could not settle the apply claim on preview {preview_id}"
        )))
    }

    async fn renew_apply_claim(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let renewed = sqlx::query(
            r"
            UPDATE directory_sync_previews
            SET apply_claimed_at = $3
            WHERE id = $1 AND apply_job_id = $2 AND applied_at IS NULL
            ",
        )
        .bind(preview_id)
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(renewed.rows_affected() == 1)
    }

    async fn complete_preview_apply(&self, completion: &ApplyCompletion) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE directory_sync_previews
            SET applied_at = $3, apply_result = $4
            WHERE id = $1 AND apply_job_id = $2 AND applied_at IS NULL
            ",
        )
        .bind(completion.preview_id)
        .bind(completion.job_id)
        .bind(completion.result.applied_at)
        .bind(Json(&completion.result))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            drop(tx);
            return match self.get_preview(completion.preview_id).await? {
                Some(_) => Ok(false),
                None => Err(StoreError::not_found("Preview", completion.preview_id)),
            };
        }

        if let Some(approval_id) = completion.approval_id {
            sqlx::query(
                r"
                UPDATE directory_deactivation_approvals
                SET applied_at = $2
                WHERE id = $1 AND status = 'approved' AND applied_at IS NULL
                ",
            )
            .bind(approval_id)
            .bind(completion.result.applied_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn ops_summary(&self, scope: &Scope, now: DateTime<Utc>) -> StoreResult<OpsSummary> {
        let mut summary = OpsSummary::default();
        if !scope.is_valid() {
            return Ok(summary);
        }
        let scoped = scope_clause(1, 2);

        let (total, enabled): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE enabled) FROM directory_sources WHERE {scoped}"
        ))
        .bind(scope.school_id)
        .bind(scope.district_id)
        .fetch_one(&self.pool)
        .await?;
        summary.sources_total = count_u32(total);
        summary.sources_enabled = count_u32(enabled);

        let runs: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM directory_source_runs WHERE {scoped} GROUP BY status"
        ))
        .bind(scope.school_id)
        .bind(scope.district_id)
        .fetch_all(&self.pool)
        .await?;
        summary.runs_by_status = runs
            .into_iter()
            .map(|(status, count)| (status, count_u32(count)))
            .collect();

        summary.last_run_at = sqlx::query_scalar(&format!(
            "SELECT MAX(COALESCE(finished_at, started_at)) FROM directory_source_runs WHERE {scoped}"
        ))
        .bind(scope.school_id)
        .bind(scope.district_id)
        .fetch_one(&self.pool)
        .await?;

        let approvals: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT {status} AS effective_status, COUNT(*) \
             FROM directory_deactivation_approvals WHERE {scoped} GROUP BY 1",
            status = effective_status_sql(3)
        ))
        .bind(scope.school_id)
        .bind(scope.district_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        summary.approvals_by_status = approvals
            .into_iter()
            .map(|(status, count)| (status, count_u32(count)))
            .collect();

        let (previews, applied, upserts, deactivations): (i64, i64, i64, i64) =
            sqlx::query_as(&format!(
                "SELECT COUNT(*), \
                        COUNT(*) FILTER (WHERE applied_at IS NOT NULL AND apply_result IS NOT NULL), \
                        COALESCE(SUM((apply_result->>'upserted')::bigint) \
                            FILTER (WHERE applied_at IS NOT NULL), 0)::bigint, \
                        COALESCE(SUM((apply_result->>'deactivated')::bigint) \
                            FILTER (WHERE applied_at IS NOT NULL), 0)::bigint \
                 FROM directory_sync_previews WHERE {scoped}"
            ))
            .bind(scope.school_id)
            .bind(scope.district_id)
            .fetch_one(&self.pool)
            .await?;
        summary.previews_total = count_u32(previews);
        summary.previews_applied = count_u32(applied);
        summary.applied_upserts = u64::try_from(upserts).unwrap_or(0);
        summary.applied_deactivations = u64::try_from(deactivations).unwrap_or(0);

        Ok(summary)
    }
}

#[async_trait]
impl CanonicalStore for PgDirectoryStore {
    async fn list_records(
        &self,
        scope: &Scope,
        record_types: &[RecordType],
    ) -> StoreResult<Vec<CanonicalRecord>> {
        if !scope.is_valid() || record_types.is_empty() {
            return Ok(Vec::new());
        }
        let types: Vec<&str> = record_types.iter().map(RecordType::as_str).collect();
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM directory_records \
             WHERE {} AND record_type = ANY($3) ORDER BY external_id, id",
            scope_clause(1, 2)
        );
        sqlx::query_as::<_, RecordRow>(&query)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(&types)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CanonicalRecord::try_from)
            .collect()
    }

    async fn upsert_record(
        &self,
        scope: &Scope,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        if !scope.is_valid() {
            return Err(StoreError::Internal(
                "Cannot upsert a record without a scope".to_string(),
            ));
        }

        // The identity index serializes concurrent inserts of one record.
        let query = format!(
            "INSERT INTO directory_records ( \
                 id, external_id, record_type, school_id, district_id, fields, \
                 active, source_id, deactivated_at, created_at, updated_at \
             ) \
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, NULL, $8, $8) \
             ON CONFLICT (external_id, record_type, school_id, district_id) DO UPDATE SET \
                 fields = directory_records.fields || EXCLUDED.fields, \
                 active = TRUE, \
                 deactivated_at = NULL, \
                 source_id = COALESCE(EXCLUDED.source_id, directory_records.source_id), \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, RecordRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&upsert.external_id)
            .bind(upsert.record_type.as_str())
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(Json(&upsert.fields))
            .bind(upsert.source_id)
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .try_into()
    }

    async fn update_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        if !scope.is_valid() {
            return Err(StoreError::not_found("Canonical record", record_id));
        }
        let query = format!(
            "UPDATE directory_records SET \
                 record_type = $4, \
                 fields = fields || $5, \
                 active = TRUE, \
                 deactivated_at = NULL, \
                 source_id = COALESCE($6, source_id), \
                 updated_at = $7 \
             WHERE id = $3 AND {} \
             RETURNING {RECORD_COLUMNS}",
            scope_clause(1, 2)
        );
        let updated = sqlx::query_as::<_, RecordRow>(&query)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(record_id)
            .bind(upsert.record_type.as_str())
            .bind(Json(&upsert.fields))
            .bind(upsert.source_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;

        match updated {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => Err(StoreError::not_found("Canonical record", record_id)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict(format!(
                    "A {} record with external id {} already exists",
                    upsert.record_type, upsert.external_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if !scope.is_valid() {
            return Err(StoreError::not_found("Canonical record", record_id));
        }
        let update = format!(
            "UPDATE directory_records SET active = FALSE, deactivated_at = $4, updated_at = $4 \
             WHERE id = $3 AND active AND {}",
            scope_clause(1, 2)
        );
        let updated = sqlx::query(&update)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(record_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = format!(
            "SELECT EXISTS (SELECT 1 FROM directory_records WHERE id = $3 AND {})",
            scope_clause(1, 2)
        );
        let exists: bool = sqlx::query_scalar(&exists)
            .bind(scope.school_id)
            .bind(scope.district_id)
            .bind(record_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::not_found("Canonical record", record_id))
        }
    }
}

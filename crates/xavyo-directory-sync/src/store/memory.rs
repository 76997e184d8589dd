//! In-memory store for tests and embedded deployments.
//!
//! A single `RwLock` guards every table, so each trait call is atomic with
//! respect to the others: the create-if-idle and compare-and-set methods take
//! the write lock for their whole check-then-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ApplyClaim, ApplyCompletion, ApprovalFilter, CanonicalStore, RunAdmission, StoreError,
    StoreResult, SyncStore,
};
use crate::models::{
    ApprovalTransition, CanonicalRecord, DeactivationApproval, DirectorySource, OpsSummary,
    Preview, RecordUpsert, RunFinish, SourceRun,
};
use crate::types::{ApprovalStatus, RecordType, RunStatus, Scope};

#[derive(Debug, Default)]
struct Tables {
    sources: HashMap<Uuid, DirectorySource>,
    runs: HashMap<Uuid, SourceRun>,
    previews: HashMap<Uuid, Preview>,
    approvals: HashMap<Uuid, DeactivationApproval>,
    records: HashMap<Uuid, CanonicalRecord>,
}

/// `SyncStore` and `CanonicalStore` backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryDirectoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a canonical record.
    pub async fn insert_record(&self, record: CanonicalRecord) {
        self.tables.write().await.records.insert(record.id, record);
    }

    pub async fn get_record(&self, record_id: Uuid) -> Option<CanonicalRecord> {
        self.tables.read().await.records.get(&record_id).cloned()
    }

    /// Every canonical record, sorted by external id.
    pub async fn records(&self) -> Vec<CanonicalRecord> {
        let tables = self.tables.read().await;
        let mut records: Vec<CanonicalRecord> = tables.records.values().cloned().collect();
        records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        records
    }
}

#[async_trait]
impl SyncStore for InMemoryDirectoryStore {
    async fn insert_source(&self, source: &DirectorySource) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.sources.contains_key(&source.id) {
            return Err(StoreError::Conflict(format!(
                "Directory source {} already exists",
                source.id
            )));
        }
        tables.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<DirectorySource>> {
        Ok(self.tables.read().await.sources.get(&source_id).cloned())
    }

    async fn list_sources(&self, scope: &Scope) -> StoreResult<Vec<DirectorySource>> {
        let tables = self.tables.read().await;
        let mut sources: Vec<DirectorySource> = tables
            .sources
            .values()
            .filter(|s| scope.contains(s.school_id, s.district_id))
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn list_scheduled_sources(&self) -> StoreResult<Vec<DirectorySource>> {
        let tables = self.tables.read().await;
        let mut sources: Vec<DirectorySource> = tables
            .sources
            .values()
            .filter(|s| s.enabled && s.schedule.is_some())
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn set_source_enabled(
        &self,
        source_id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DirectorySource>> {
        let mut tables = self.tables.write().await;
        Ok(tables.sources.get_mut(&source_id).map(|source| {
            source.enabled = enabled;
            source.updated_at = now;
            source.clone()
        }))
    }

    async fn fail_abandoned_runs(
        &self,
        source_id: Uuid,
        stale_before: DateTime<Utc>,
        finish: &RunFinish,
    ) -> StoreResult<Vec<Uuid>> {
        let mut tables = self.tables.write().await;
        let mut reclaimed = Vec::new();
        for run in tables.runs.values_mut().filter(|r| {
            r.source_id == source_id
                && r.status.is_active()
                && r.started_at.unwrap_or(r.created_at) < stale_before
        }) {
            run.finish(finish.clone());
            reclaimed.push(run.id);
        }
        Ok(reclaimed)
    }

    async fn try_insert_run(&self, run: &SourceRun) -> StoreResult<RunAdmission> {
        let mut tables = self.tables.write().await;
        if let Some(active) = tables
            .runs
            .values()
            .find(|r| r.source_id == run.source_id && r.status.is_active())
        {
            return Ok(RunAdmission::InProgress { run_id: active.id });
        }
        tables.runs.insert(run.id, run.clone());
        Ok(RunAdmission::Admitted(run.clone()))
    }

    async fn mark_run_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("Source run", run_id))?;
        if run.status != RunStatus::Queued {
            return Err(StoreError::Conflict(format!(
                "Source run {run_id} is {}, expected queued",
                run.status
            )));
        }
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, finish: &RunFinish) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("Source run", run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "Source run {run_id} is already {}",
                run.status
            )));
        }
        run.finish(finish.clone());
        let source_id = run.source_id;
        if let Some(source) = tables.sources.get_mut(&source_id) {
            source.last_run_at = Some(finish.finished_at);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<SourceRun>> {
        Ok(self.tables.read().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SourceRun>> {
        let tables = self.tables.read().await;
        let mut runs: Vec<SourceRun> = tables
            .runs
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn insert_preview(
        &self,
        preview: &Preview,
        approval: Option<&DeactivationApproval>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.previews.contains_key(&preview.id) {
            return Err(StoreError::Conflict(format!(
                "Preview {} already exists",
                preview.id
            )));
        }
        if let Some(approval) = approval {
            if tables.approvals.contains_key(&approval.id) {
                return Err(StoreError::Conflict(format!(
                    "Approval {} already exists",
                    approval.id
                )));
            }
            tables.approvals.insert(approval.id, approval.clone());
        }
        tables.previews.insert(preview.id, preview.clone());
        Ok(())
    }

    async fn get_preview(&self, preview_id: Uuid) -> StoreResult<Option<Preview>> {
        Ok(self.tables.read().await.previews.get(&preview_id).cloned())
    }

    async fn get_approval(&self, approval_id: Uuid) -> StoreResult<Option<DeactivationApproval>> {
        Ok(self.tables.read().await.approvals.get(&approval_id).cloned())
    }

    async fn list_approvals(
        &self,
        scope: &Scope,
        filter: &ApprovalFilter,
    ) -> StoreResult<Vec<DeactivationApproval>> {
        let tables = self.tables.read().await;
        let mut approvals: Vec<DeactivationApproval> = tables
            .approvals
            .values()
            .filter(|a| scope.contains(a.school_id, a.district_id))
            .filter(|a| {
                filter
                    .status
                    .map_or(true, |status| a.effective_status(filter.now) == status)
            })
            .cloned()
            .collect();
        approvals.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        approvals.truncate(filter.limit);
        Ok(approvals)
    }

    async fn transition_approval(
        &self,
        approval_id: Uuid,
        transition: &ApprovalTransition,
    ) -> StoreResult<Option<DeactivationApproval>> {
        let mut tables = self.tables.write().await;
        let Some(approval) = tables.approvals.get_mut(&approval_id) else {
            return Ok(None);
        };
        if !approval.status.can_transition_to(transition.to) {
            return Ok(None);
        }
        approval.status = transition.to;
        approval.decided_by = transition.decided_by;
        approval.decided_at = Some(transition.decided_at);
        approval.decision_reason = transition.reason.clone();
        Ok(Some(approval.clone()))
    }

    async fn claim_preview_apply(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ApplyClaim> {
        let mut tables = self.tables.write().await;
        let Some(preview) = tables.previews.get_mut(&preview_id) else {
            return Ok(ApplyClaim::NotFound);
        };
        if preview.applied_at.is_some() {
            return Ok(ApplyClaim::AlreadyApplied(preview.clone()));
        }
        if let (Some(holder), Some(claimed_at)) = (preview.apply_job_id, preview.apply_claimed_at) {
            if claimed_at >= stale_before {
                return Ok(ApplyClaim::InProgress { job_id: holder });
            }
        }
        preview.apply_job_id = Some(job_id);
        preview.apply_claimed_at = Some(now);
        Ok(ApplyClaim::Claimed(preview.clone()))
    }

    async fn renew_apply_claim(
        &self,
        preview_id: Uuid,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.previews.get_mut(&preview_id) {
            Some(preview) if preview.applied_at.is_none() && preview.apply_job_id == Some(job_id) => {
                preview.apply_claimed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_preview_apply(&self, completion: &ApplyCompletion) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(preview) = tables.previews.get_mut(&completion.preview_id) else {
            return Err(StoreError::not_found("Preview", completion.preview_id));
        };
        if preview.applied_at.is_some() || preview.apply_job_id != Some(completion.job_id) {
            return Ok(false);
        }
        preview.applied_at = Some(completion.result.applied_at);
        preview.apply_result = Some(completion.result.clone());

        if let Some(approval_id) = completion.approval_id {
            if let Some(approval) = tables.approvals.get_mut(&approval_id) {
                if approval.status == ApprovalStatus::Approved && approval.applied_at.is_none() {
                    approval.applied_at = Some(completion.result.applied_at);
                }
            }
        }
        Ok(true)
    }

    async fn ops_summary(&self, scope: &Scope, now: DateTime<Utc>) -> StoreResult<OpsSummary> {
        let tables = self.tables.read().await;
        let mut summary = OpsSummary::default();

        for source in tables
            .sources
            .values()
            .filter(|s| scope.contains(s.school_id, s.district_id))
        {
            summary.sources_total += 1;
            if source.enabled {
                summary.sources_enabled += 1;
            }
        }

        for run in tables
            .runs
            .values()
            .filter(|r| scope.contains(r.school_id, r.district_id))
        {
            *summary
                .runs_by_status
                .entry(run.status.as_str().to_string())
                .or_insert(0) += 1;
            let finished = run.finished_at.or(run.started_at);
            if finished > summary.last_run_at {
                summary.last_run_at = finished;
            }
        }

        for approval in tables
            .approvals
            .values()
            .filter(|a| scope.contains(a.school_id, a.district_id))
        {
            *summary
                .approvals_by_status
                .entry(approval.effective_status(now).as_str().to_string())
                .or_insert(0) += 1;
        }

        for preview in tables
            .previews
            .values()
            .filter(|p| scope.contains(p.school_id, p.district_id))
        {
            summary.previews_total += 1;
            if let (Some(_), Some(result)) = (preview.applied_at, &preview.apply_result) {
                summary.previews_applied += 1;
                summary.applied_upserts += u64::from(result.upserted);
                summary.applied_deactivations += u64::from(result.deactivated);
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl CanonicalStore for InMemoryDirectoryStore {
    async fn list_records(
        &self,
        scope: &Scope,
        record_types: &[RecordType],
    ) -> StoreResult<Vec<CanonicalRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<CanonicalRecord> = tables
            .records
            .values()
            .filter(|r| scope.contains(r.school_id, r.district_id))
            .filter(|r| record_types.contains(&r.record_type))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.external_id.cmp(&b.external_id).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn upsert_record(
        &self,
        scope: &Scope,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .records
            .values()
            .find(|r| {
                r.external_id == upsert.external_id
                    && r.record_type == upsert.record_type
                    && r.scope() == *scope
            })
            .map(|r| r.id);

        let record = match existing.and_then(|id| tables.records.get_mut(&id)) {
            Some(record) => {
                record.apply_upsert(upsert, now);
                record.clone()
            }
            None => {
                let mut record = CanonicalRecord::new(
                    upsert.external_id.clone(),
                    upsert.record_type,
                    *scope,
                    upsert.fields.clone(),
                    now,
                );
                record.source_id = upsert.source_id;
                tables.records.insert(record.id, record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn update_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        let mut tables = self.tables.write().await;
        let record_scope = tables
            .records
            .get(&record_id)
            .filter(|r| scope.contains(r.school_id, r.district_id))
            .map(CanonicalRecord::scope)
            .ok_or_else(|| StoreError::not_found("Canonical record", record_id))?;

        // Same identity rule as the Postgres unique index.
        if tables.records.values().any(|r| {
            r.id != record_id
                && r.external_id == upsert.external_id
                && r.record_type == upsert.record_type
                && r.scope() == record_scope
        }) {
            return Err(StoreError::Conflict(format!(
                "A {} record with external id {} already exists",
                upsert.record_type, upsert.external_id
            )));
        }

        let record = tables
            .records
            .get_mut(&record_id)
            .ok_or_else(|| StoreError::not_found("Canonical record", record_id))?;
        record.apply_upsert(upsert, now);
        Ok(record.clone())
    }

    async fn deactivate_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .get_mut(&record_id)
            .filter(|r| scope.contains(r.school_id, r.district_id))
            .ok_or_else(|| StoreError::not_found("Canonical record", record_id))?;
        if !record.active {
            return Ok(false);
        }
        record.active = false;
        record.deactivated_at = Some(now);
        record.updated_at = now;
        Ok(true)
    }
}

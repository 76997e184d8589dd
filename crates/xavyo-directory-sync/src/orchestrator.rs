//! Run orchestrator: admits a run, fetches and diffs the feed, and persists
//! the resulting preview.
//!
//! A run never holds a lock while it waits on the adapter. Per-source
//! serialization comes from the store's create-if-idle insert.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{emit, AuditAction, AuditEntity, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::DirectorySyncConfig;
use crate::diff::{compute_diff, Diff, DiffOptions, DiffOutcome};
use crate::error::{DirectorySyncError, DirectorySyncResult};
use crate::models::{
    DeactivationApproval, DirectorySource, Preview, RunFinish, SourceRun, SyncOptions,
};
use crate::normalizer::{NormalizedRow, NormalizerError, NormalizerRegistry};
use crate::statistics::{RowError, SyncStats};
use crate::store::{CanonicalStore, RunAdmission, SyncStore};
use crate::types::{Actor, ApprovalStatus};

/// Candidate ids copied into approval metadata for reviewers.
const APPROVAL_SAMPLE_SIZE: usize = 20;

/// Response of a sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSourceResult {
    pub run_id: Uuid,
    pub preview_id: Uuid,
    pub requires_approval: bool,
    pub approval_id: Option<Uuid>,
    pub stats: SyncStats,
    pub errors: Vec<RowError>,
    pub errors_truncated: u32,
}

/// Whether a preview must pass the approval gate before it can be applied.
#[must_use]
pub fn requires_approval(diff: &Diff, options: SyncOptions) -> bool {
    !diff.deactivation_candidates.is_empty() && options.deactivate_missing && !options.dry_run
}

/// Runs syncs for directory sources.
#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn SyncStore>,
    records: Arc<dyn CanonicalStore>,
    normalizers: Arc<NormalizerRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: DirectorySyncConfig,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn SyncStore>,
        records: Arc<dyn CanonicalStore>,
        normalizers: Arc<NormalizerRegistry>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: DirectorySyncConfig,
    ) -> Self {
        Self {
            store,
            records,
            normalizers,
            audit,
            clock,
            config,
        }
    }

    /// Source by id, scoped to the actor.
    pub(crate) async fn load_source(
        &self,
        actor: &Actor,
        source_id: Uuid,
    ) -> DirectorySyncResult<DirectorySource> {
        self.store
            .get_source(source_id)
            .await?
            .filter(|s| actor.can_access(s.school_id, s.district_id))
            .ok_or(DirectorySyncError::SourceNotFound { source_id })
    }

    /// Fetch, normalize and diff a source, persisting a preview.
    pub async fn sync_source(
        &self,
        actor: &Actor,
        source_id: Uuid,
        options: SyncOptions,
    ) -> DirectorySyncResult<SyncSourceResult> {
        let source = self.load_source(actor, source_id).await?;
        if !source.enabled {
            return Err(DirectorySyncError::SourceDisabled { source_id });
        }

        self.reclaim_abandoned_runs(actor, &source).await?;

        let queued = SourceRun::queued(&source, options, actor.actor_id, self.clock.now());
        let run = match self.store.try_insert_run(&queued).await? {
            RunAdmission::Admitted(run) => run,
            RunAdmission::InProgress { run_id } => {
                debug!(source_id = %source_id, run_id = %run_id, "Sync already in progress");
                return Err(DirectorySyncError::RunInProgress { source_id, run_id });
            }
        };

        let started_at = self.clock.now();
        if let Err(e) = self.store.mark_run_running(run.id, started_at).await {
            let e = DirectorySyncError::from(e);
            self.fail(actor, &source, &run, &e, Instant::now()).await;
            return Err(e);
        }

        info!(
            source_id = %source_id,
            run_id = %run.id,
            source_type = %source.source_type,
            dry_run = options.dry_run,
            deactivate_missing = options.deactivate_missing,
            "Directory sync started"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                AuditAction::SyncStarted,
                AuditEntity::SourceRun,
                run.id,
                source.scope(),
                started_at,
            )
            .with_metadata(json!({
                "source_id": source_id,
                "dry_run": options.dry_run,
                "deactivate_missing": options.deactivate_missing,
            })),
        )
        .await;

        let timer = Instant::now();
        match self.execute(actor, &source, &run, options, timer).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.fail(actor, &source, &run, &e, timer).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        actor: &Actor,
        source: &DirectorySource,
        run: &SourceRun,
        options: SyncOptions,
        timer: Instant,
    ) -> DirectorySyncResult<SyncSourceResult> {
        let rows = self.fetch_rows(source).await?;

        // Fresh snapshot, read after the fetch so it is as current as possible.
        let canonical = self
            .records
            .list_records(&source.scope(), &source.record_types)
            .await?;

        let diff_options = DiffOptions {
            max_row_errors: self.config.max_row_errors,
            ..DiffOptions::default()
        };
        let DiffOutcome {
            diff,
            mut stats,
            errors,
            errors_truncated,
        } = compute_diff(&source.scope(), &canonical, &rows, &diff_options);
        stats.dry_run = options.dry_run;
        stats.duration_ms = elapsed_ms(timer);

        let now = self.clock.now();
        let expires_at = now + self.config.preview_ttl();
        let gated = requires_approval(&diff, options);

        let preview_id = Uuid::new_v4();
        let approval = gated.then(|| DeactivationApproval {
            id: Uuid::new_v4(),
            preview_id,
            source_id: source.id,
            source_run_id: run.id,
            school_id: source.school_id,
            district_id: source.district_id,
            status: ApprovalStatus::Pending,
            requested_by: actor.actor_id,
            requested_at: now,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
            applied_at: None,
            expires_at,
            stats: stats.clone(),
            metadata: json!({
                "source_name": source.name,
                "deactivation_count": diff.deactivation_candidates.len(),
                "sample_external_ids": diff.candidate_ids(APPROVAL_SAMPLE_SIZE),
            }),
        });

        let preview = Preview {
            id: preview_id,
            source_id: source.id,
            source_run_id: run.id,
            school_id: source.school_id,
            district_id: source.district_id,
            diff,
            stats: stats.clone(),
            deactivate_missing: options.deactivate_missing,
            dry_run: options.dry_run,
            requires_approval: gated,
            approval_id: approval.as_ref().map(|a| a.id),
            apply_job_id: None,
            apply_claimed_at: None,
            apply_result: None,
            applied_at: None,
            expires_at,
            created_at: now,
        };

        self.store.insert_preview(&preview, approval.as_ref()).await?;

        let finished_at = self.clock.now();
        self.store
            .finish_run(
                run.id,
                &RunFinish::succeeded(
                    finished_at,
                    stats.clone(),
                    errors.clone(),
                    errors_truncated,
                    preview.id,
                ),
            )
            .await?;

        info!(
            source_id = %source.id,
            run_id = %run.id,
            preview_id = %preview.id,
            total_rows = stats.total_rows,
            invalid_rows = stats.invalid_rows,
            adds = stats.adds,
            updates = stats.updates,
            deactivation_candidates = stats.deactivation_candidates,
            requires_approval = gated,
            duration_ms = stats.duration_ms,
            "Directory sync completed"
        );

        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                AuditAction::SyncCompleted,
                AuditEntity::SourceRun,
                run.id,
                source.scope(),
                finished_at,
            )
            .with_metadata(json!({
                "source_id": source.id,
                "preview_id": preview.id,
                "stats": stats,
                "errors_truncated": errors_truncated,
            })),
        )
        .await;

        if let Some(approval) = &approval {
            emit(
                self.audit.as_ref(),
                AuditEvent::by(
                    actor,
                    AuditAction::ApprovalRequested,
                    AuditEntity::DeactivationApproval,
                    approval.id,
                    approval.scope(),
                    finished_at,
                )
                .with_metadata(json!({
                    "preview_id": preview.id,
                    "deactivation_count": stats.deactivation_candidates,
                    "expires_at": approval.expires_at,
                })),
            )
            .await;
        }

        Ok(SyncSourceResult {
            run_id: run.id,
            preview_id: preview.id,
            requires_approval: gated,
            approval_id: approval.map(|a| a.id),
            stats,
            errors,
            errors_truncated,
        })
    }

    /// Fail runs that outlived the fetch timeout plus grace without
    /// finishing. Their worker is gone (dropped future, restart), so the
    /// one-active-run slot would otherwise stay taken forever.
    async fn reclaim_abandoned_runs(
        &self,
        actor: &Actor,
        source: &DirectorySource,
    ) -> DirectorySyncResult<()> {
        let now = self.clock.now();
        let stale_after = self.config.run_stale_after(source.fetch_timeout_secs);
        let message = format!(
            "Run abandoned: not finished within {}s",
            stale_after.num_seconds()
        );
        let finish = RunFinish::failed(now, SyncStats::default(), message);

        let reclaimed = self
            .store
            .fail_abandoned_runs(source.id, now - stale_after, &finish)
            .await?;
        for run_id in reclaimed {
            warn!(source_id = %source.id, run_id = %run_id, "Reclaimed abandoned directory sync run");
            emit(
                self.audit.as_ref(),
                AuditEvent::by(
                    actor,
                    AuditAction::SyncFailed,
                    AuditEntity::SourceRun,
                    run_id,
                    source.scope(),
                    now,
                )
                .with_metadata(json!({
                    "source_id": source.id,
                    "code": "abandoned",
                    "error": finish.error_message,
                })),
            )
            .await;
        }
        Ok(())
    }

    /// Resolve the adapter and fetch rows within the source's timeout.
    async fn fetch_rows(&self, source: &DirectorySource) -> DirectorySyncResult<Vec<NormalizedRow>> {
        let normalizer = self.normalizers.get(&source.source_type).ok_or_else(|| {
            DirectorySyncError::AdapterUnreachable {
                source_type: source.source_type.clone(),
                message: NormalizerError::UnknownSourceType(source.source_type.clone()).to_string(),
            }
        })?;

        let timeout = self.config.fetch_timeout(source.fetch_timeout_secs);
        match tokio::time::timeout(timeout, normalizer.normalize(source)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(DirectorySyncError::AdapterUnreachable {
                source_type: source.source_type.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(DirectorySyncError::Timeout {
                source_id: source.id,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Mark the run failed and audit it. Errors here are logged only; the
    /// caller surfaces the original failure.
    async fn fail(
        &self,
        actor: &Actor,
        source: &DirectorySource,
        run: &SourceRun,
        cause: &DirectorySyncError,
        timer: Instant,
    ) {
        error!(
            source_id = %source.id,
            run_id = %run.id,
            code = cause.code(),
            error = %cause,
            "Directory sync failed"
        );

        let stats = SyncStats {
            dry_run: run.dry_run,
            duration_ms: elapsed_ms(timer),
            ..SyncStats::default()
        };
        let finished_at = self.clock.now();
        if let Err(e) = self
            .store
            .finish_run(run.id, &RunFinish::failed(finished_at, stats, cause.to_string()))
            .await
        {
            warn!(run_id = %run.id, error = %e, "Failed to mark run as failed");
        }

        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                AuditAction::SyncFailed,
                AuditEntity::SourceRun,
                run.id,
                source.scope(),
                finished_at,
            )
            .with_metadata(json!({
                "source_id": source.id,
                "code": cause.code(),
                "error": cause.to_string(),
            })),
        )
        .await;
    }

    /// Runs of a source, newest first.
    pub async fn list_runs(
        &self,
        actor: &Actor,
        source_id: Uuid,
        limit: usize,
    ) -> DirectorySyncResult<Vec<SourceRun>> {
        let source = self.load_source(actor, source_id).await?;
        Ok(self.store.list_runs(source.id, limit).await?)
    }

    pub async fn get_run(&self, actor: &Actor, run_id: Uuid) -> DirectorySyncResult<SourceRun> {
        self.store
            .get_run(run_id)
            .await?
            .filter(|r| actor.can_access(r.school_id, r.district_id))
            .ok_or(DirectorySyncError::RunNotFound { run_id })
    }
}

fn elapsed_ms(timer: Instant) -> u64 {
    u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DeactivationCandidate;
    use crate::types::RecordType;

    fn diff_with_candidate() -> Diff {
        Diff {
            deactivation_candidates: vec![DeactivationCandidate {
                external_id: "s-1".to_string(),
                record_id: Uuid::new_v4(),
                record_type: RecordType::Student,
                display_name: None,
            }],
            ..Diff::default()
        }
    }

    #[test]
    fn test_requires_approval_needs_all_three_conditions() {
        let gated = SyncOptions {
            deactivate_missing: true,
            dry_run: false,
        };
        assert!(requires_approval(&diff_with_candidate(), gated));
        assert!(!requires_approval(&Diff::default(), gated));
        assert!(!requires_approval(
            &diff_with_candidate(),
            SyncOptions {
                deactivate_missing: false,
                dry_run: false
            }
        ));
        assert!(!requires_approval(
            &diff_with_candidate(),
            SyncOptions {
                deactivate_missing: true,
                dry_run: true
            }
        ));
    }
}

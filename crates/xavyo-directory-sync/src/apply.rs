//! Apply executor: writes an approved (or ungated) preview into the
//! canonical store, at most once.
//!
//! The preview's `apply_job_id` column is the claim. A running apply renews
//! it every third of the claim TTL and stops writing once it is lost. Adds
//! are upserts keyed by external id and record type, updates target the
//! diffed record by id, and deactivations are soft, so re-taking a stale
//! claim after a crash only repeats harmless work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{guard_apply, ApplyGuard, ApprovalGate};
use crate::audit::{emit, AuditAction, AuditEntity, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::DirectorySyncConfig;
use crate::diff::DeactivationCandidate;
use crate::error::{DirectorySyncError, DirectorySyncResult};
use crate::models::{Preview, RecordUpsert};
use crate::statistics::ErrorCollector;
use crate::store::{ApplyClaim, ApplyCompletion, CanonicalStore, StoreError, SyncStore};
use crate::types::{Actor, RecordType};

/// Outcome of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    /// At least one item failed; the rest were written.
    PartiallyApplied,
}

impl ApplyStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Applied => "applied",
            ApplyStatus::PartiallyApplied => "partially_applied",
        }
    }
}

/// Kind of write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    Upsert,
    Deactivate,
}

/// A single failed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyItemError {
    pub external_id: String,
    pub record_type: RecordType,
    pub operation: ApplyOperation,
    pub message: String,
}

/// Result of applying a preview, cached on the preview and replayed on retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub ok: bool,
    pub approval_id: Option<Uuid>,
    pub preview_id: Uuid,
    pub job_id: Uuid,
    pub status: ApplyStatus,
    pub upserted: u32,
    pub deactivated: u32,
    pub apply_errors: Vec<ApplyItemError>,
    /// Item errors dropped after the cap.
    #[serde(default)]
    pub apply_errors_truncated: u32,
    pub applied_at: DateTime<Utc>,
    /// `true` when this is the cached result of an earlier apply.
    #[serde(default)]
    pub replayed: bool,
}

impl ApplyResult {
    fn replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}

/// One write: a new record for adds, the diffed record for updates.
#[derive(Debug)]
struct RecordWrite {
    record_id: Option<Uuid>,
    upsert: RecordUpsert,
}

#[derive(Debug, Default)]
struct RecordTypeGroup<'a> {
    writes: Vec<RecordWrite>,
    deactivations: Vec<&'a DeactivationCandidate>,
}

/// Keeps an apply claim fresh while items are written.
struct ClaimLease {
    preview_id: Uuid,
    job_id: Uuid,
    renewed_at: DateTime<Utc>,
    renew_every: chrono::Duration,
}

impl ClaimLease {
    /// Renew when due. `false` once another job holds the claim.
    async fn keep(&mut self, store: &dyn SyncStore, now: DateTime<Utc>) -> bool {
        if now - self.renewed_at < self.renew_every {
            return true;
        }
        match store.renew_apply_claim(self.preview_id, self.job_id, now).await {
            Ok(true) => {
                debug!(preview_id = %self.preview_id, job_id = %self.job_id, "Renewed apply claim");
                self.renewed_at = now;
                true
            }
            Ok(false) => false,
            Err(e) => {
                // Keep writing; the next item retries the renewal.
                warn!(preview_id = %self.preview_id, job_id = %self.job_id, error = %e, "Failed to renew apply claim");
                true
            }
        }
    }
}

/// Executes previews against the canonical store.
#[derive(Clone)]
pub struct ApplyExecutor {
    store: Arc<dyn SyncStore>,
    records: Arc<dyn CanonicalStore>,
    gate: ApprovalGate,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: DirectorySyncConfig,
}

impl ApplyExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn SyncStore>,
        records: Arc<dyn CanonicalStore>,
        gate: ApprovalGate,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: DirectorySyncConfig,
    ) -> Self {
        Self {
            store,
            records,
            gate,
            audit,
            clock,
            config,
        }
    }

    /// Apply the preview behind an approved approval.
    pub async fn apply(&self, actor: &Actor, approval_id: Uuid) -> DirectorySyncResult<ApplyResult> {
        let approval = self.gate.load(actor, approval_id).await?;
        let now = self.clock.now();

        let guard = match guard_apply(&approval, now) {
            Ok(guard) => guard,
            Err(e) => {
                if matches!(e, DirectorySyncError::ApprovalExpired { .. }) {
                    self.gate.expire(&approval, now).await;
                }
                return Err(e);
            }
        };

        let preview = self
            .store
            .get_preview(approval.preview_id)
            .await?
            .ok_or(DirectorySyncError::PreviewNotFound {
                preview_id: approval.preview_id,
            })?;

        if guard == ApplyGuard::Replay {
            if let Some(result) = preview.apply_result.clone() {
                return Ok(result.replay());
            }
        }

        self.execute(actor, preview, Some(approval_id)).await
    }

    /// Apply an ungated, non-dry-run preview directly.
    pub async fn apply_preview(
        &self,
        actor: &Actor,
        preview_id: Uuid,
    ) -> DirectorySyncResult<ApplyResult> {
        let preview = self
            .store
            .get_preview(preview_id)
            .await?
            .filter(|p| actor.can_access(p.school_id, p.district_id))
            .ok_or(DirectorySyncError::PreviewNotFound { preview_id })?;
        let now = self.clock.now();

        if preview.is_expired(now) {
            return Err(DirectorySyncError::PreviewExpired {
                preview_id,
                expires_at: preview.expires_at,
            });
        }
        if preview.dry_run {
            return Err(DirectorySyncError::PreviewNotApplicable {
                preview_id,
                reason: "dry-run previews are never applied".to_string(),
            });
        }
        if preview.requires_approval {
            return Err(DirectorySyncError::PreviewNotApplicable {
                preview_id,
                reason: "preview proposes deactivations and must be applied through its approval"
                    .to_string(),
            });
        }
        if let Some(result) = preview.apply_result.clone().filter(|_| preview.is_applied()) {
            return Ok(result.replay());
        }

        self.execute(actor, preview, None).await
    }

    async fn execute(
        &self,
        actor: &Actor,
        preview: Preview,
        approval_id: Option<Uuid>,
    ) -> DirectorySyncResult<ApplyResult> {
        let job_id = Uuid::new_v4();
        let now = self.clock.now();
        let stale_before = now - self.config.apply_claim_ttl();

        let preview = match self
            .store
            .claim_preview_apply(preview.id, job_id, now, stale_before)
            .await?
        {
            ApplyClaim::Claimed(preview) => preview,
            ApplyClaim::AlreadyApplied(preview) => {
                return preview
                    .apply_result
                    .map(ApplyResult::replay)
                    .ok_or_else(|| {
                        StoreError::Internal(format!(
                            "Preview {} is applied but has no cached result",
                            preview.id
                        ))
                        .into()
                    });
            }
            ApplyClaim::InProgress { job_id: holder } => {
                return Err(DirectorySyncError::ApplyInProgress {
                    preview_id: preview.id,
                    job_id: holder,
                });
            }
            ApplyClaim::NotFound => {
                return Err(DirectorySyncError::PreviewNotFound {
                    preview_id: preview.id,
                });
            }
        };

        let deactivations = if preview.deactivate_missing {
            preview.diff.deactivation_candidates.len()
        } else {
            0
        };
        info!(
            preview_id = %preview.id,
            job_id = %job_id,
            adds = preview.diff.adds.len(),
            updates = preview.diff.updates.len(),
            deactivations,
            "Applying directory preview"
        );

        let lease = ClaimLease {
            preview_id: preview.id,
            job_id,
            renewed_at: now,
            renew_every: self.config.apply_claim_renew_every(),
        };
        let Some(result) = self.write(&preview, approval_id, lease).await else {
            warn!(preview_id = %preview.id, job_id = %job_id, "Apply claim lost mid-write; stopping");
            return Err(DirectorySyncError::ApplyInProgress {
                preview_id: preview.id,
                job_id,
            });
        };

        let completion = ApplyCompletion {
            preview_id: preview.id,
            approval_id,
            job_id,
            result: result.clone(),
        };
        match self.store.complete_preview_apply(&completion).await {
            Ok(true) => {}
            Ok(false) => {
                // Our claim went stale and another job took over.
                warn!(preview_id = %preview.id, job_id = %job_id, "Apply claim lost before completion");
                return Err(DirectorySyncError::ApplyInProgress {
                    preview_id: preview.id,
                    job_id,
                });
            }
            Err(e) => {
                // Leave the claim in place; it goes stale and a retry repeats the idempotent writes.
                warn!(preview_id = %preview.id, job_id = %job_id, error = %e, "Failed to record apply result");
                return Err(e.into());
            }
        }

        info!(
            preview_id = %preview.id,
            job_id = %job_id,
            status = result.status.as_str(),
            upserted = result.upserted,
            deactivated = result.deactivated,
            errors = result.apply_errors.len() + result.apply_errors_truncated as usize,
            "Directory preview applied"
        );

        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                AuditAction::PreviewApplied,
                AuditEntity::Preview,
                preview.id,
                preview.scope(),
                result.applied_at,
            )
            .with_metadata(json!({
                "approval_id": approval_id,
                "job_id": job_id,
                "status": result.status,
                "upserted": result.upserted,
                "deactivated": result.deactivated,
                "apply_errors": result.apply_errors.len() + result.apply_errors_truncated as usize,
            })),
        )
        .await;

        Ok(result)
    }

    /// Write every item, isolating failures per item. `None` when the claim
    /// was taken over before the last item.
    async fn write(
        &self,
        preview: &Preview,
        approval_id: Option<Uuid>,
        mut lease: ClaimLease,
    ) -> Option<ApplyResult> {
        let job_id = lease.job_id;
        let scope = preview.scope();
        let mut groups: BTreeMap<RecordType, RecordTypeGroup<'_>> = BTreeMap::new();

        for add in &preview.diff.adds {
            groups.entry(add.record_type).or_default().writes.push(RecordWrite {
                record_id: None,
                upsert: RecordUpsert {
                    external_id: add.external_id.clone(),
                    record_type: add.record_type,
                    fields: add.fields.clone(),
                    source_id: Some(preview.source_id),
                },
            });
        }
        for update in &preview.diff.updates {
            groups.entry(update.record_type).or_default().writes.push(RecordWrite {
                record_id: Some(update.record_id),
                upsert: RecordUpsert {
                    external_id: update.external_id.clone(),
                    record_type: update.record_type,
                    fields: update
                        .changes
                        .iter()
                        .map(|(field, change)| (field.clone(), change.to.clone()))
                        .collect(),
                    source_id: Some(preview.source_id),
                },
            });
        }
        if preview.deactivate_missing {
            for candidate in &preview.diff.deactivation_candidates {
                groups
                    .entry(candidate.record_type)
                    .or_default()
                    .deactivations
                    .push(candidate);
            }
        }

        let mut upserted = 0u32;
        let mut deactivated = 0u32;
        let mut errors = ErrorCollector::new(self.config.max_apply_errors);

        for (record_type, group) in groups {
            for write in &group.writes {
                if !lease.keep(self.store.as_ref(), self.clock.now()).await {
                    return None;
                }
                let upsert = &write.upsert;
                let outcome = match write.record_id {
                    Some(record_id) => {
                        self.records
                            .update_record(&scope, record_id, upsert, self.clock.now())
                            .await
                    }
                    None => self.records.upsert_record(&scope, upsert, self.clock.now()).await,
                };
                match outcome {
                    Ok(_) => upserted += 1,
                    Err(e) => {
                        warn!(external_id = %upsert.external_id, error = %e, "Upsert failed");
                        errors.push(ApplyItemError {
                            external_id: upsert.external_id.clone(),
                            record_type,
                            operation: ApplyOperation::Upsert,
                            message: e.to_string(),
                        });
                    }
                }
            }
            for candidate in group.deactivations {
                if !lease.keep(self.store.as_ref(), self.clock.now()).await {
                    return None;
                }
                match self
                    .records
                    .deactivate_record(&scope, candidate.record_id, self.clock.now())
                    .await
                {
                    Ok(true) => deactivated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(external_id = %candidate.external_id, error = %e, "Deactivation failed");
                        errors.push(ApplyItemError {
                            external_id: candidate.external_id.clone(),
                            record_type,
                            operation: ApplyOperation::Deactivate,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        let status = if errors.is_empty() {
            ApplyStatus::Applied
        } else {
            ApplyStatus::PartiallyApplied
        };
        let (apply_errors, apply_errors_truncated) = errors.into_parts();

        Some(ApplyResult {
            ok: true,
            approval_id,
            preview_id: preview.id,
            job_id,
            status,
            upserted,
            deactivated,
            apply_errors,
            apply_errors_truncated,
            applied_at: self.clock.now(),
            replayed: false,
        })
    }
}

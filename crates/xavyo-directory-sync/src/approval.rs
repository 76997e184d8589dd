//! Approval gate for destructive previews.
//!
//! An approval moves one way only: `pending -> approved | rejected | expired`.
//! Expiry is lazy; nothing sweeps stale approvals. Readers see the effective
//! status, and the first write path that meets a stale pending approval
//! marks it expired.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{emit, AuditAction, AuditEntity, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::error::{DirectorySyncError, DirectorySyncResult};
use crate::models::{ApprovalTransition, DeactivationApproval};
use crate::store::{ApprovalFilter, SyncStore};
use crate::types::{Actor, ApprovalStatus};

/// A reviewer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    /// Status the decision moves the approval to.
    #[must_use]
    pub fn target(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        }
    }

    fn audit_action(&self) -> AuditAction {
        match self {
            ApprovalDecision::Approve => AuditAction::ApprovalApproved,
            ApprovalDecision::Reject => AuditAction::ApprovalRejected,
        }
    }
}

/// Outcome of the decision guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionGuard {
    /// Attempt the compare-and-set.
    Proceed,
    /// The same decision is already recorded.
    AlreadyDecided,
    /// Pending past expiry: mark expired, then refuse.
    ExpirePending,
}

/// Outcome of the apply guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyGuard {
    Execute,
    /// Already applied; return the cached result.
    Replay,
}

/// Decision guards, in order: expiry, expired status, idempotent repeat,
/// closed status.
pub fn guard_decision(
    approval: &DeactivationApproval,
    decision: ApprovalDecision,
    now: chrono::DateTime<chrono::Utc>,
) -> DirectorySyncResult<DecisionGuard> {
    if approval.is_expired(now) {
        if approval.status == ApprovalStatus::Pending {
            return Ok(DecisionGuard::ExpirePending);
        }
        return Err(expired(approval));
    }
    match approval.status {
        ApprovalStatus::Expired => Err(expired(approval)),
        status if status == decision.target() => Ok(DecisionGuard::AlreadyDecided),
        ApprovalStatus::Pending => Ok(DecisionGuard::Proceed),
        status => Err(DirectorySyncError::ApprovalClosed {
            approval_id: approval.id,
            status,
        }),
    }
}

/// Apply guards, in order: expiry (whatever the status), replay, closed,
/// not yet approved.
pub fn guard_apply(
    approval: &DeactivationApproval,
    now: chrono::DateTime<chrono::Utc>,
) -> DirectorySyncResult<ApplyGuard> {
    if approval.is_expired(now) {
        return Err(expired(approval));
    }
    if approval.applied_at.is_some() {
        return Ok(ApplyGuard::Replay);
    }
    match approval.status {
        ApprovalStatus::Approved => Ok(ApplyGuard::Execute),
        ApprovalStatus::Pending => Err(DirectorySyncError::ApprovalNotApproved {
            approval_id: approval.id,
            status: approval.status,
        }),
        ApprovalStatus::Rejected | ApprovalStatus::Expired => {
            Err(DirectorySyncError::ApprovalClosed {
                approval_id: approval.id,
                status: approval.status,
            })
        }
    }
}

fn expired(approval: &DeactivationApproval) -> DirectorySyncError {
    DirectorySyncError::ApprovalExpired {
        approval_id: approval.id,
        expires_at: approval.expires_at,
    }
}

/// Decides approvals and owns their status column.
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn SyncStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(store: Arc<dyn SyncStore>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            audit,
            clock,
        }
    }

    /// Stored approval, scoped to the actor. Out-of-scope reads as not found.
    pub(crate) async fn load(
        &self,
        actor: &Actor,
        approval_id: Uuid,
    ) -> DirectorySyncResult<DeactivationApproval> {
        self.store
            .get_approval(approval_id)
            .await?
            .filter(|a| actor.can_access(a.school_id, a.district_id))
            .ok_or(DirectorySyncError::ApprovalNotFound { approval_id })
    }

    /// Approval with its effective status. Never writes.
    pub async fn get(
        &self,
        actor: &Actor,
        approval_id: Uuid,
    ) -> DirectorySyncResult<DeactivationApproval> {
        let approval = self.load(actor, approval_id).await?;
        Ok(approval.with_effective_status(self.clock.now()))
    }

    /// Approvals in the actor's scope with effective statuses.
    pub async fn list(
        &self,
        actor: &Actor,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> DirectorySyncResult<Vec<DeactivationApproval>> {
        let now = self.clock.now();
        let filter = ApprovalFilter { status, limit, now };
        let approvals = self.store.list_approvals(&actor.scope, &filter).await?;
        Ok(approvals
            .into_iter()
            .map(|a| a.with_effective_status(now))
            .collect())
    }

    pub async fn approve(
        &self,
        actor: &Actor,
        approval_id: Uuid,
        reason: Option<String>,
    ) -> DirectorySyncResult<DeactivationApproval> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self.decide(actor, approval_id, ApprovalDecision::Approve, reason)
            .await
    }

    /// Reject; a non-blank reason is required.
    pub async fn reject(
        &self,
        actor: &Actor,
        approval_id: Uuid,
        reason: &str,
    ) -> DirectorySyncResult<DeactivationApproval> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DirectorySyncError::Validation(
                "A reason is required to reject an approval".to_string(),
            ));
        }
        self.decide(
            actor,
            approval_id,
            ApprovalDecision::Reject,
            Some(reason.to_string()),
        )
        .await
    }

    async fn decide(
        &self,
        actor: &Actor,
        approval_id: Uuid,
        decision: ApprovalDecision,
        reason: Option<String>,
    ) -> DirectorySyncResult<DeactivationApproval> {
        let approval = self.load(actor, approval_id).await?;
        let now = self.clock.now();

        match guard_decision(&approval, decision, now)? {
            DecisionGuard::AlreadyDecided => {
                debug!(
                    approval_id = %approval_id,
                    status = %approval.status,
                    "Approval decision already recorded"
                );
                return Ok(approval);
            }
            DecisionGuard::ExpirePending => {
                self.expire(&approval, now).await;
                return Err(expired(&approval));
            }
            DecisionGuard::Proceed => {}
        }

        let transition = ApprovalTransition {
            to: decision.target(),
            decided_by: actor.actor_id,
            decided_at: now,
            reason,
        };

        let Some(updated) = self
            .store
            .transition_approval(approval_id, &transition)
            .await?
        else {
            // Lost the compare-and-set to a concurrent decision.
            let current = self.load(actor, approval_id).await?;
            return Err(DirectorySyncError::ApprovalClosed {
                approval_id,
                status: current.effective_status(now),
            });
        };

        info!(
            approval_id = %approval_id,
            preview_id = %updated.preview_id,
            status = %updated.status,
            "Deactivation approval decided"
        );

        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                decision.audit_action(),
                AuditEntity::DeactivationApproval,
                approval_id,
                updated.scope(),
                now,
            )
            .with_metadata(json!({
                "preview_id": updated.preview_id,
                "source_id": updated.source_id,
                "reason": updated.decision_reason,
            })),
        )
        .await;

        Ok(updated)
    }

    /// Mark a stale pending approval expired. Failures are logged; callers
    /// report expiry either way.
    pub(crate) async fn expire(&self, approval: &DeactivationApproval, now: chrono::DateTime<chrono::Utc>) {
        match self
            .store
            .transition_approval(approval.id, &ApprovalTransition::expire(now))
            .await
        {
            Ok(Some(expired)) => {
                warn!(
                    approval_id = %expired.id,
                    expires_at = %expired.expires_at,
                    "Deactivation approval expired before a decision"
                );
                emit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        None,
                        AuditAction::ApprovalExpired,
                        AuditEntity::DeactivationApproval,
                        expired.id,
                        expired.scope(),
                        now,
                    )
                    .with_metadata(json!({ "preview_id": expired.preview_id })),
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!(
                approval_id = %approval.id,
                error = %e,
                "Failed to mark approval expired"
            ),
        }
    }
}

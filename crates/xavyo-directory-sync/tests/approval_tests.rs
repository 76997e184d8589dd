//! Approval gate behavior: decisions, idempotency and lazy expiry.

mod common;

use chrono::Duration;
use common::Harness;
use serde_json::json;
use uuid::Uuid;
use xavyo_directory_sync::{
    ApprovalStatus, AuditAction, DirectorySyncConfig, RecordType, SyncOptions, SyncStore,
};

const GATED: SyncOptions = SyncOptions {
    deactivate_missing: true,
    dry_run: false,
};

/// Sync a feed that drops `s-2`, returning the pending approval id.
async fn pending_approval(h: &Harness) -> Uuid {
    let source = h.fixture_source().await;
    h.seed("s-1", RecordType::Student, json!({})).await;
    h.seed("s-2", RecordType::Student, json!({})).await;
    h.feed.set_rows(vec![("s-1", RecordType::Student, json!({}))]);
    h.service
        .sync_source(&h.actor, source.id, GATED)
        .await
        .unwrap()
        .approval_id
        .unwrap()
}

fn ttl() -> Duration {
    DirectorySyncConfig::default().preview_ttl()
}

#[tokio::test]
async fn test_approve_is_idempotent() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;
    let reviewer = h.reviewer();

    let first = h
        .service
        .approve(&reviewer, approval_id, Some("  roster confirmed ".into()))
        .await
        .unwrap();
    assert_eq!(first.status, ApprovalStatus::Approved);
    assert_eq!(first.decided_by, reviewer.actor_id);
    assert_eq!(first.decision_reason.as_deref(), Some("roster confirmed"));

    h.clock.advance(Duration::minutes(5));
    let second = h.service.approve(&h.actor, approval_id, None).await.unwrap();
    assert_eq!(second.decided_at, first.decided_at);
    assert_eq!(second.decided_by, reviewer.actor_id);
    assert_eq!(h.audit.count(AuditAction::ApprovalApproved), 1);
}

#[tokio::test]
async fn test_conflicting_decision_is_closed() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;

    h.service.approve(&h.actor, approval_id, None).await.unwrap();
    let err = h
        .service
        .reject(&h.actor, approval_id, "changed my mind")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "approval_closed");
    assert!(err.is_conflict());

    let h = Harness::new();
    let approval_id = pending_approval(&h).await;
    h.service.reject(&h.actor, approval_id, "no").await.unwrap();
    // Repeating the same rejection is a no-op.
    h.service.reject(&h.actor, approval_id, "no").await.unwrap();
    let err = h.service.approve(&h.actor, approval_id, None).await.unwrap_err();
    assert_eq!(err.code(), "approval_closed");
    assert_eq!(h.audit.count(AuditAction::ApprovalRejected), 1);
}

#[tokio::test]
async fn test_reject_requires_reason() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;

    let err = h.service.reject(&h.actor, approval_id, "   ").await.unwrap_err();
    assert_eq!(err.code(), "validation");

    let stored = h.store.get_approval(approval_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn test_reads_report_expiry_without_writing() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;

    h.clock.advance(ttl());

    let detail = h.service.get_approval(&h.actor, approval_id).await.unwrap();
    assert_eq!(detail.approval.status, ApprovalStatus::Expired);
    assert!(detail.preview.is_some());

    let pending = h
        .service
        .list_approvals(&h.actor, Some(ApprovalStatus::Pending), None)
        .await
        .unwrap();
    assert!(pending.is_empty());
    let expired = h
        .service
        .list_approvals(&h.actor, Some(ApprovalStatus::Expired), None)
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    let stored = h.store.get_approval(approval_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Pending);
    assert_eq!(h.audit.count(AuditAction::ApprovalExpired), 0);
}

#[tokio::test]
async fn test_deciding_after_expiry_marks_expired_once() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;

    h.clock.advance(ttl() + Duration::hours(1));

    let err = h.service.approve(&h.actor, approval_id, None).await.unwrap_err();
    assert_eq!(err.code(), "approval_expired");

    let stored = h.store.get_approval(approval_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Expired);
    assert!(stored.decided_by.is_none());

    let err = h
        .service
        .reject(&h.actor, approval_id, "too late")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "approval_expired");
    assert_eq!(h.audit.count(AuditAction::ApprovalExpired), 1);
}

#[tokio::test]
async fn test_approved_but_expired_is_not_applied() {
    let h = Harness::new();
    let approval_id = pending_approval(&h).await;

    h.service.approve(&h.actor, approval_id, None).await.unwrap();
    h.clock.advance(ttl());

    let err = h.service.apply(&h.actor, approval_id).await.unwrap_err();
    assert_eq!(err.code(), "approval_expired");
    assert_eq!(h.active_ids().await, vec!["s-1", "s-2"]);

    // An approved record keeps its decision; only pending ones are expired.
    let stored = h.store.get_approval(approval_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_list_is_newest_first_and_clamped() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    h.seed("s-1", RecordType::Student, json!({})).await;
    h.feed.set_rows(vec![]);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let result = h.service.sync_source(&h.actor, source.id, GATED).await.unwrap();
        ids.push(result.approval_id.unwrap());
        h.clock.advance(Duration::minutes(1));
    }

    let listed = h.service.list_approvals(&h.actor, None, None).await.unwrap();
    let listed: Vec<Uuid> = listed.into_iter().map(|a| a.id).collect();
    ids.reverse();
    assert_eq!(listed, ids);

    let limited = h.service.list_approvals(&h.actor, None, Some(0)).await.unwrap();
    assert_eq!(limited.len(), 1);
}

//! Apply executor: at-most-once semantics, concurrency and partial failure.

mod common;

use chrono::Duration;
use common::Harness;
use serde_json::json;
use xavyo_directory_sync::store::ApplyClaim;
use xavyo_directory_sync::{
    ApplyOperation, ApplyStatus, AuditAction, DirectorySyncConfig, RecordType, SyncOptions,
    SyncStore,
};

const GATED: SyncOptions = SyncOptions {
    deactivate_missing: true,
    dry_run: false,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_write_once() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    for id in ["s-1", "s-2", "s-3", "s-4"] {
        h.seed(id, RecordType::Student, json!({})).await;
    }
    h.feed.set_rows(vec![
        ("s-1", RecordType::Student, json!({})),
        ("s-5", RecordType::Student, json!({"first_name": "New"})),
    ]);
    let approval_id = h
        .service
        .sync_source(&h.actor, source.id, GATED)
        .await
        .unwrap()
        .approval_id
        .unwrap();
    h.service.approve(&h.actor, approval_id, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let actor = h.actor;
        handles.push(tokio::spawn(async move {
            service.apply(&actor, approval_id).await
        }));
    }

    let mut executed = Vec::new();
    let mut replayed = 0;
    let mut in_progress = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) if result.replayed => replayed += 1,
            Ok(result) => executed.push(result),
            Err(e) => {
                assert_eq!(e.code(), "apply_in_progress");
                in_progress += 1;
            }
        }
    }

    assert_eq!(executed.len(), 1, "exactly one apply executes");
    assert_eq!(replayed + in_progress, 7);
    assert_eq!(executed[0].upserted, 1);
    assert_eq!(executed[0].deactivated, 3);
    assert_eq!(h.active_ids().await, vec!["s-1", "s-5"]);
    assert_eq!(h.audit.count(AuditAction::PreviewApplied), 1);

    // Every later call replays the one result.
    let replay = h.service.apply(&h.actor, approval_id).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.job_id, executed[0].job_id);
}

#[tokio::test]
async fn test_partial_failure_is_reported_and_cached() {
    let h = Harness::with_failing_writes(&["t-2"]);
    let source = h.fixture_source().await;
    h.feed.set_rows(vec![
        ("t-1", RecordType::Staff, json!({})),
        ("t-2", RecordType::Staff, json!({})),
        ("t-3", RecordType::Staff, json!({})),
    ]);
    let preview_id = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap()
        .preview_id;

    let result = h.service.apply_preview(&h.actor, preview_id).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    assert_eq!(result.upserted, 2);
    assert_eq!(result.apply_errors.len(), 1);
    assert_eq!(result.apply_errors[0].external_id, "t-2");
    assert_eq!(result.apply_errors[0].operation, ApplyOperation::Upsert);
    assert_eq!(h.active_ids().await, vec!["t-1", "t-3"]);

    // A retry replays the cached partial result instead of retrying the failed item.
    let replay = h.service.apply_preview(&h.actor, preview_id).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.status, ApplyStatus::PartiallyApplied);
    assert_eq!(replay.apply_errors, result.apply_errors);
}

#[tokio::test]
async fn test_ungated_preview_skips_deactivations() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    h.seed("t-1", RecordType::Staff, json!({})).await;
    h.feed.set_rows(vec![("t-2", RecordType::Staff, json!({}))]);

    // Without deactivate_missing the missing record is only reported.
    let result = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stats.deactivation_candidates, 1);
    assert!(!result.requires_approval);

    let applied = h.service.apply_preview(&h.actor, result.preview_id).await.unwrap();
    assert_eq!(applied.upserted, 1);
    assert_eq!(applied.deactivated, 0);
    assert_eq!(h.active_ids().await, vec!["t-1", "t-2"]);
}

#[tokio::test]
async fn test_expired_preview_is_not_applied() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    h.feed.set_rows(vec![("t-1", RecordType::Staff, json!({}))]);
    let preview_id = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap()
        .preview_id;

    h.clock
        .advance(DirectorySyncConfig::default().preview_ttl() + Duration::seconds(1));
    let err = h.service.apply_preview(&h.actor, preview_id).await.unwrap_err();
    assert_eq!(err.code(), "preview_expired");
    assert!(h.active_ids().await.is_empty());
}

#[tokio::test]
async fn test_apply_reactivates_returning_records() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    h.seed("s-1", RecordType::Student, json!({})).await;
    h.seed("s-2", RecordType::Student, json!({})).await;

    h.feed.set_rows(vec![("s-1", RecordType::Student, json!({}))]);
    let approval_id = h
        .service
        .sync_source(&h.actor, source.id, GATED)
        .await
        .unwrap()
        .approval_id
        .unwrap();
    h.service.approve(&h.actor, approval_id, None).await.unwrap();
    h.service.apply(&h.actor, approval_id).await.unwrap();
    assert_eq!(h.active_ids().await, vec!["s-1"]);

    // s-2 comes back in the next feed.
    h.feed.set_rows(vec![
        ("s-1", RecordType::Student, json!({})),
        ("s-2", RecordType::Student, json!({})),
    ]);
    let result = h.service.sync_source(&h.actor, source.id, GATED).await.unwrap();
    assert!(!result.requires_approval);
    assert_eq!(result.stats.updates, 1);
    let preview = h.service.get_preview(&h.actor, result.preview_id).await.unwrap();
    assert!(preview.diff.updates[0].reactivate);

    h.service.apply_preview(&h.actor, result.preview_id).await.unwrap();
    assert_eq!(h.active_ids().await, vec!["s-1", "s-2"]);
}

#[tokio::test]
async fn test_student_feed_never_touches_staff_with_same_external_id() {
    let h = Harness::new();
    let mut input = h.source_input("fixture", json!({}));
    input.record_types = vec![RecordType::Student];
    let source = h.service.create_source(&h.actor, input).await.unwrap();

    let staff = h
        .seed("x-1", RecordType::Staff, json!({"first_name": "Teacher"}))
        .await;
    h.feed
        .set_rows(vec![("x-1", RecordType::Student, json!({"first_name": "Kid"}))]);

    let result = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stats.adds, 1);
    assert_eq!(result.stats.updates, 0);

    let applied = h.service.apply_preview(&h.actor, result.preview_id).await.unwrap();
    assert_eq!(applied.upserted, 1);

    let staff_after = h.store.get_record(staff.id).await.unwrap();
    assert_eq!(staff_after.record_type, RecordType::Staff);
    assert_eq!(staff_after.fields["first_name"], json!("Teacher"));

    let records = h.store.records().await;
    assert_eq!(records.len(), 2);
    let student = records
        .iter()
        .find(|r| r.record_type == RecordType::Student)
        .unwrap();
    assert_eq!(student.external_id, "x-1");
    assert_eq!(student.fields["first_name"], json!("Kid"));
}

#[tokio::test]
async fn test_update_retypes_the_diffed_record() {
    let h = Harness::new();
    let source = h.fixture_source().await;
    let record = h
        .seed("x-2", RecordType::Staff, json!({"first_name": "Aide"}))
        .await;
    h.feed
        .set_rows(vec![("x-2", RecordType::Student, json!({"first_name": "Aide"}))]);

    let result = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stats.updates, 1);

    h.service.apply_preview(&h.actor, result.preview_id).await.unwrap();
    let records = h.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record.id);
    assert_eq!(records[0].record_type, RecordType::Student);
}

#[tokio::test]
async fn test_slow_apply_keeps_its_claim_past_the_ttl() {
    let (h, records) = Harness::with_slow_writes(Duration::seconds(400));
    let source = h.fixture_source().await;
    h.feed.set_rows(
        ["t-1", "t-2", "t-3", "t-4", "t-5"]
            .into_iter()
            .map(|id| (id, RecordType::Staff, json!({})))
            .collect(),
    );
    let preview_id = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap()
        .preview_id;
    *records.watched_preview.lock().unwrap() = Some(preview_id);

    // Five writes at 400s each outlast the 900s claim TTL.
    let result = h.service.apply_preview(&h.actor, preview_id).await.unwrap();
    assert_eq!(result.upserted, 5);

    let attempts = records.takeover_attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 5);
    for attempt in attempts {
        assert!(
            matches!(attempt, ApplyClaim::InProgress { job_id } if job_id == result.job_id),
            "{attempt:?}"
        );
    }
    assert_eq!(h.audit.count(AuditAction::PreviewApplied), 1);
}

#[tokio::test]
async fn test_apply_stops_writing_once_its_claim_is_taken() {
    // A single write outlasts the TTL, so the competing job wins the claim.
    let (h, records) = Harness::with_slow_writes(Duration::seconds(1000));
    let source = h.fixture_source().await;
    h.feed.set_rows(vec![
        ("t-1", RecordType::Staff, json!({})),
        ("t-2", RecordType::Staff, json!({})),
        ("t-3", RecordType::Staff, json!({})),
    ]);
    let preview_id = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap()
        .preview_id;
    *records.watched_preview.lock().unwrap() = Some(preview_id);

    let err = h.service.apply_preview(&h.actor, preview_id).await.unwrap_err();
    assert_eq!(err.code(), "apply_in_progress");
    assert_eq!(h.active_ids().await, vec!["t-1"]);
    assert!(matches!(
        records.takeover_attempts.lock().unwrap()[0],
        ApplyClaim::Claimed(_)
    ));

    let preview = h.store.get_preview(preview_id).await.unwrap().unwrap();
    assert!(preview.applied_at.is_none());
    assert_eq!(h.audit.count(AuditAction::PreviewApplied), 0);
}

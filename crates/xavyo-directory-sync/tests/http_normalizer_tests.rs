//! HTTP JSON adapter against a mock server.

mod common;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::Harness;
use xavyo_directory_sync::{
    CreateDirectorySource, DirectorySource, FeedUrlPolicy, HttpJsonNormalizer, Normalizer,
    NormalizerError, RecordType, Scope, SyncOptions,
};
use uuid::Uuid;

// =============================================================================
// Test Helpers
// =============================================================================

fn http_source(config: JsonValue) -> DirectorySource {
    CreateDirectorySource {
        name: "SIS API".to_string(),
        school_id: Scope::school(Uuid::new_v4()).school_id,
        district_id: None,
        source_type: "http_json".to_string(),
        config,
        record_types: vec![RecordType::Student],
        schedule: None,
        fetch_timeout_secs: None,
        enabled: true,
    }
    .into_source(Utc::now())
}

/// Adapter allowed to reach the loopback mock server.
fn loopback_adapter() -> HttpJsonNormalizer {
    HttpJsonNormalizer::new().with_policy(FeedUrlPolicy::permissive())
}

// =============================================================================
// Adapter Tests
// =============================================================================

#[tokio::test]
async fn test_fetches_rows_at_pointer_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/roster"))
        .and(header("Authorization", "Bearer sis-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "people": [
                    {"id": "S-1", "first_name": " Grace ", "kind": "student"},
                    {"id": 42, "kind": "teacher"},
                    {"first_name": "No id"}
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = http_source(json!({
        "url": format!("{}/roster", server.uri()),
        "bearer_token": "sis-token",
        "rows_pointer": "/data/people",
        "external_id_field": "id",
        "record_type_field": "kind"
    }));

    let rows = loopback_adapter().normalize(&source).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].external_id.as_deref(), Some("S-1"));
    assert_eq!(rows[0].record_type, RecordType::Student);
    assert_eq!(rows[0].fields["first_name"], json!("Grace"));
    assert_eq!(rows[1].external_id.as_deref(), Some("42"));
    assert_eq!(rows[1].record_type, RecordType::Staff);
    assert!(rows[2].normalized_external_id().is_none());
}

#[tokio::test]
async fn test_error_status_is_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/roster"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let source = http_source(json!({ "url": format!("{}/roster", server.uri()) }));
    let err = loopback_adapter().normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::Unreachable(_)), "{err:?}");
}

#[tokio::test]
async fn test_non_json_and_bad_pointer_are_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/object"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let adapter = loopback_adapter();

    let source = http_source(json!({ "url": format!("{}/html", server.uri()) }));
    let err = adapter.normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::Malformed(_)), "{err:?}");

    let source = http_source(json!({
        "url": format!("{}/object", server.uri()),
        "rows_pointer": "/data/people"
    }));
    let err = adapter.normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::Malformed(_)), "{err:?}");

    let source = http_source(json!({ "url": format!("{}/object", server.uri()) }));
    let err = adapter.normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::Malformed(_)), "{err:?}");
}

#[tokio::test]
async fn test_missing_url_is_invalid_config() {
    let source = http_source(json!({}));
    let err = loopback_adapter().normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::InvalidConfig(_)), "{err:?}");
}

#[tokio::test]
async fn test_default_adapter_never_contacts_loopback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let source = http_source(json!({ "url": format!("{}/roster", server.uri()) }));
    let err = HttpJsonNormalizer::new().normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::InvalidConfig(_)), "{err:?}");
}

#[tokio::test]
async fn test_redirects_are_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/latest/"),
        )
        .mount(&server)
        .await;

    let source = http_source(json!({ "url": format!("{}/moved", server.uri()) }));
    let err = loopback_adapter().normalize(&source).await.unwrap_err();
    assert!(matches!(err, NormalizerError::Unreachable(_)), "{err:?}");
    assert!(err.to_string().contains("302"));
}

// =============================================================================
// Through the service
// =============================================================================

#[tokio::test]
async fn test_locked_down_service_refuses_internal_feed_sources() {
    let service = xavyo_directory_sync::DirectorySyncService::builder(
        std::sync::Arc::new(xavyo_directory_sync::InMemoryDirectoryStore::new()),
        std::sync::Arc::new(xavyo_directory_sync::InMemoryDirectoryStore::new()),
    )
    .build();
    let scope = Scope::school(Uuid::new_v4());
    let actor = xavyo_directory_sync::Actor::new(Uuid::new_v4(), scope);
    let input = |source_type: &str, config: JsonValue| CreateDirectorySource {
        name: "Feed".to_string(),
        school_id: scope.school_id,
        district_id: None,
        source_type: source_type.to_string(),
        config,
        record_types: vec![],
        schedule: None,
        fetch_timeout_secs: None,
        enabled: true,
    };

    for (source_type, config) in [
        ("http_json", json!({"url": "http://169.254.169.254/latest/meta-data/"})),
        ("http_json", json!({"url": "http://localhost:5432/"})),
        ("csv", json!({"path": "/etc/passwd", "delimiter": ":"})),
    ] {
        let err = service
            .create_source(&actor, input(source_type, config.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation", "{config}");
    }

    service
        .create_source(
            &actor,
            input("http_json", json!({"url": "https://sis.example.org/roster.json"})),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_slow_feed_times_out_and_fails_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let h = Harness::new();
    let mut input = h.source_input("http_json", json!({ "url": format!("{}/slow", server.uri()) }));
    input.fetch_timeout_secs = Some(1);
    let source = h.service.create_source(&h.actor, input).await.unwrap();

    let err = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert!(err.is_retryable());

    let runs = h.service.list_runs(&h.actor, source.id, None).await.unwrap();
    assert_eq!(runs[0].status, xavyo_directory_sync::RunStatus::Failed);
}

#[tokio::test]
async fn test_http_feed_produces_preview() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/staff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"external_id": "T-1", "email": "t1@school.test"},
            {"external_id": "T-2", "email": "t2@school.test"}
        ])))
        .mount(&server)
        .await;

    let h = Harness::new();
    let source = h
        .service
        .create_source(
            &h.actor,
            h.source_input(
                "http_json",
                json!({ "url": format!("{}/staff", server.uri()), "record_type": "staff" }),
            ),
        )
        .await
        .unwrap();

    let result = h
        .service
        .sync_source(&h.actor, source.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stats.adds, 2);
    assert!(!result.requires_approval);
}

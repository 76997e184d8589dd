//! Test fixtures for the directory sync router.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use xavyo_api_directory_sync::{directory_sync_router, DirectorySyncState};
use xavyo_directory_sync::{
    CanonicalStore, DirectorySyncService, InMemoryAuditSink, InMemoryDirectoryStore, ManualClock,
    RecordType, RecordUpsert, Scope,
};

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Router wired to an in-memory store and a manual clock.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryDirectoryStore>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<InMemoryAuditSink>,
    pub actor_id: Uuid,
    pub school_id: Uuid,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let audit = Arc::new(InMemoryAuditSink::new());
        let service = DirectorySyncService::builder(store.clone(), store.clone())
            .clock(clock.clone())
            .audit(audit.clone())
            .build();

        Self {
            router: directory_sync_router(DirectorySyncState::new(service)),
            store,
            clock,
            audit,
            actor_id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::school(self.school_id)
    }

    pub async fn seed(&self, external_id: &str) {
        self.store
            .upsert_record(
                &self.scope(),
                &RecordUpsert {
                    external_id: external_id.to_string(),
                    record_type: RecordType::Student,
                    fields: Default::default(),
                    source_id: None,
                },
                self.clock_now(),
            )
            .await
            .unwrap();
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use xavyo_directory_sync::Clock;
        self.clock.now()
    }

    /// Send a request as the default actor.
    pub async fn send(&self, method: &str, uri: &str, body: Option<JsonValue>) -> TestResponse {
        self.send_as(self.school_id, method, uri, body).await
    }

    /// Send a request as an actor scoped to `school_id`.
    pub async fn send_as(
        &self,
        school_id: Uuid,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Actor-Id", self.actor_id.to_string())
            .header("X-School-Id", school_id.to_string());
        self.dispatch(request, body).await
    }

    pub async fn send_anonymous(&self, method: &str, uri: &str) -> TestResponse {
        self.dispatch(Request::builder().method(method).uri(uri), None)
            .await
    }

    async fn dispatch(
        &self,
        builder: axum::http::request::Builder,
        body: Option<JsonValue>,
    ) -> TestResponse {
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);

        TestResponse {
            status,
            content_type,
            json,
        }
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub json: JsonValue,
}

impl TestResponse {
    /// Problem `code` member, for error responses.
    pub fn code(&self) -> &str {
        self.json["code"].as_str().unwrap_or_default()
    }

    pub fn id(&self, field: &str) -> Uuid {
        self.json[field].as_str().unwrap().parse().unwrap()
    }
}

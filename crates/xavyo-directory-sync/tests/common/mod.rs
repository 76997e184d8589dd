//! Shared fixtures for directory sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::Notify;
use uuid::Uuid;

use xavyo_directory_sync::store::{ApplyClaim, StoreResult};
use xavyo_directory_sync::{
    Actor, CanonicalRecord, CanonicalStore, CreateDirectorySource, DirectorySource,
    DirectorySyncConfig, DirectorySyncService, InMemoryAuditSink, InMemoryDirectoryStore,
    ManualClock, NormalizedRow, Normalizer, NormalizerError, NormalizerRegistry, RecordType,
    RecordUpsert, Scope, StoreError, SyncSchedule, SyncStore,
};

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn fields(value: JsonValue) -> Map<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}

/// Feed adapter under test control (`source_type = "fixture"`).
#[derive(Default)]
pub struct FixtureFeed {
    rows: Mutex<Vec<NormalizedRow>>,
    failure: Mutex<Option<String>>,
    blocking: AtomicBool,
    pub started: Notify,
    pub release: Notify,
}

impl FixtureFeed {
    /// Replace the feed with `(external_id, record_type, fields)` rows.
    pub fn set_rows(&self, rows: Vec<(&str, RecordType, JsonValue)>) {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, (id, record_type, value))| {
                NormalizedRow::new(i, Some(id.to_string()), record_type, fields(value))
            })
            .collect();
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_raw_rows(&self, rows: Vec<NormalizedRow>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make the next fetches wait on `release`, signalling `started` first.
    pub fn block(&self) {
        self.blocking.store(true, Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.blocking.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl Normalizer for FixtureFeed {
    fn source_type(&self) -> &str {
        "fixture"
    }

    async fn normalize(
        &self,
        _source: &DirectorySource,
    ) -> Result<Vec<NormalizedRow>, NormalizerError> {
        if self.blocking.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(NormalizerError::Unreachable(message));
        }
        Ok(self.rows.lock().unwrap().clone())
    }
}

/// Canonical store that fails upserts for chosen external ids.
pub struct FlakyRecords {
    pub inner: Arc<InMemoryDirectoryStore>,
    pub failing: HashSet<String>,
}

#[async_trait]
impl CanonicalStore for FlakyRecords {
    async fn list_records(
        &self,
        scope: &Scope,
        record_types: &[RecordType],
    ) -> StoreResult<Vec<CanonicalRecord>> {
        self.inner.list_records(scope, record_types).await
    }

    async fn upsert_record(
        &self,
        scope: &Scope,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        if self.failing.contains(&upsert.external_id) {
            return Err(StoreError::Internal(format!(
                "write rejected for {}",
                upsert.external_id
            )));
        }
        self.inner.upsert_record(scope, upsert, now).await
    }

    async fn update_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        if self.failing.contains(&upsert.external_id) {
            return Err(StoreError::Internal(format!(
                "write rejected for {}",
                upsert.external_id
            )));
        }
        self.inner.update_record(scope, record_id, upsert, now).await
    }

    async fn deactivate_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.deactivate_record(scope, record_id, now).await
    }
}

/// Canonical store whose writes each take `write_time` on the manual clock.
/// After every write a competing job tries to take over the apply claim of
/// `watched_preview`; the outcomes are kept in `takeover_attempts`.
pub struct SlowRecords {
    pub inner: Arc<InMemoryDirectoryStore>,
    pub clock: Arc<ManualClock>,
    pub write_time: chrono::Duration,
    pub claim_ttl: chrono::Duration,
    pub watched_preview: Mutex<Option<Uuid>>,
    pub takeover_attempts: Mutex<Vec<ApplyClaim>>,
}

impl SlowRecords {
    async fn after_write(&self) {
        self.clock.advance(self.write_time);
        let watched = *self.watched_preview.lock().unwrap();
        if let Some(preview_id) = watched {
            let now = self.clock_now();
            let attempt = self
                .inner
                .claim_preview_apply(preview_id, Uuid::new_v4(), now, now - self.claim_ttl)
                .await
                .unwrap();
            self.takeover_attempts.lock().unwrap().push(attempt);
        }
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use xavyo_directory_sync::Clock;
        self.clock.now()
    }
}

#[async_trait]
impl CanonicalStore for SlowRecords {
    async fn list_records(
        &self,
        scope: &Scope,
        record_types: &[RecordType],
    ) -> StoreResult<Vec<CanonicalRecord>> {
        self.inner.list_records(scope, record_types).await
    }

    async fn upsert_record(
        &self,
        scope: &Scope,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        let record = self.inner.upsert_record(scope, upsert, now).await;
        self.after_write().await;
        record
    }

    async fn update_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        upsert: &RecordUpsert,
        now: DateTime<Utc>,
    ) -> StoreResult<CanonicalRecord> {
        let record = self.inner.update_record(scope, record_id, upsert, now).await;
        self.after_write().await;
        record
    }

    async fn deactivate_record(
        &self,
        scope: &Scope,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let deactivated = self.inner.deactivate_record(scope, record_id, now).await;
        self.after_write().await;
        deactivated
    }
}

pub struct Harness {
    pub store: Arc<InMemoryDirectoryStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub clock: Arc<ManualClock>,
    pub feed: Arc<FixtureFeed>,
    pub service: DirectorySyncService,
    pub scope: Scope,
    pub actor: Actor,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryDirectoryStore::new());
        Self::build(store.clone(), store, Arc::new(ManualClock::new(start_time())))
    }

    /// Harness whose canonical writes fail for `failing` external ids.
    pub fn with_failing_writes(failing: &[&str]) -> Self {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let records = Arc::new(FlakyRecords {
            inner: store.clone(),
            failing: failing.iter().map(|id| (*id).to_string()).collect(),
        });
        Self::build(store, records, Arc::new(ManualClock::new(start_time())))
    }

    /// Harness whose canonical writes each take `write_time`.
    pub fn with_slow_writes(write_time: chrono::Duration) -> (Self, Arc<SlowRecords>) {
        let store = Arc::new(InMemoryDirectoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let records = Arc::new(SlowRecords {
            inner: store.clone(),
            clock: clock.clone(),
            write_time,
            claim_ttl: DirectorySyncConfig::default().apply_claim_ttl(),
            watched_preview: Mutex::new(None),
            takeover_attempts: Mutex::new(Vec::new()),
        });
        (Self::build(store, records.clone(), clock), records)
    }

    fn build(
        store: Arc<InMemoryDirectoryStore>,
        records: Arc<dyn CanonicalStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        init_test_logging();

        let audit = Arc::new(InMemoryAuditSink::new());
        let feed = Arc::new(FixtureFeed::default());

        // Mock feed servers listen on loopback.
        let config = DirectorySyncConfig {
            http_allow_private_networks: true,
            ..DirectorySyncConfig::default()
        };
        let mut normalizers = NormalizerRegistry::from_config(&config);
        normalizers.register(feed.clone());

        let service = DirectorySyncService::builder(store.clone(), records)
            .audit(audit.clone())
            .clock(clock.clone())
            .normalizers(normalizers)
            .config(config)
            .build();

        let scope = Scope::school(Uuid::new_v4());
        Self {
            store,
            audit,
            clock,
            feed,
            service,
            scope,
            actor: Actor::new(Uuid::new_v4(), scope),
        }
    }

    /// A second user in the same scope.
    pub fn reviewer(&self) -> Actor {
        Actor::new(Uuid::new_v4(), self.scope)
    }

    /// A user in an unrelated school.
    pub fn outsider(&self) -> Actor {
        Actor::new(Uuid::new_v4(), Scope::school(Uuid::new_v4()))
    }

    pub fn source_input(&self, source_type: &str, config: JsonValue) -> CreateDirectorySource {
        CreateDirectorySource {
            name: "District SIS".to_string(),
            school_id: self.scope.school_id,
            district_id: self.scope.district_id,
            source_type: source_type.to_string(),
            config,
            record_types: vec![],
            schedule: None,
            fetch_timeout_secs: None,
            enabled: true,
        }
    }

    /// A `fixture` source reading from [`FixtureFeed`].
    pub async fn fixture_source(&self) -> DirectorySource {
        self.service
            .create_source(&self.actor, self.source_input("fixture", json!({})))
            .await
            .unwrap()
    }

    pub async fn scheduled_source(&self, cron: &str, deactivate_missing: bool) -> DirectorySource {
        let mut input = self.source_input("fixture", json!({}));
        input.schedule = Some(SyncSchedule {
            cron: cron.to_string(),
            timezone: "UTC".to_string(),
            deactivate_missing,
        });
        self.service.create_source(&self.actor, input).await.unwrap()
    }

    /// Seed an active canonical record in the harness scope.
    pub async fn seed(&self, external_id: &str, record_type: RecordType, value: JsonValue) -> CanonicalRecord {
        let record = CanonicalRecord::new(
            external_id,
            record_type,
            self.scope,
            fields(value),
            self.clock_now(),
        );
        self.store.insert_record(record.clone()).await;
        record
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use xavyo_directory_sync::Clock;
        self.clock.now()
    }

    /// Active external ids, sorted.
    pub async fn active_ids(&self) -> Vec<String> {
        self.store
            .records()
            .await
            .into_iter()
            .filter(|r| r.active)
            .map(|r| r.external_id)
            .collect()
    }
}

//! Audit trail for state-changing operations.
//!
//! Events are emitted after the transition they describe has been committed.
//! A failing sink is logged and never undoes the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Actor, Scope};

/// Audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "source.created")]
    SourceCreated,
    #[serde(rename = "source.enabled")]
    SourceEnabled,
    #[serde(rename = "source.disabled")]
    SourceDisabled,
    #[serde(rename = "source.sync.started")]
    SyncStarted,
    #[serde(rename = "source.sync.completed")]
    SyncCompleted,
    #[serde(rename = "source.sync.failed")]
    SyncFailed,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.approved")]
    ApprovalApproved,
    #[serde(rename = "approval.rejected")]
    ApprovalRejected,
    #[serde(rename = "approval.expired")]
    ApprovalExpired,
    #[serde(rename = "preview.applied")]
    PreviewApplied,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SourceCreated => "source.created",
            AuditAction::SourceEnabled => "source.enabled",
            AuditAction::SourceDisabled => "source.disabled",
            AuditAction::SyncStarted => "source.sync.started",
            AuditAction::SyncCompleted => "source.sync.completed",
            AuditAction::SyncFailed => "source.sync.failed",
            AuditAction::ApprovalRequested => "approval.requested",
            AuditAction::ApprovalApproved => "approval.approved",
            AuditAction::ApprovalRejected => "approval.rejected",
            AuditAction::ApprovalExpired => "approval.expired",
            AuditAction::PreviewApplied => "preview.applied",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    DirectorySource,
    SourceRun,
    Preview,
    DeactivationApproval,
}

impl AuditEntity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntity::DirectorySource => "directory_source",
            AuditEntity::SourceRun => "source_run",
            AuditEntity::Preview => "preview",
            AuditEntity::DeactivationApproval => "deactivation_approval",
        }
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// `None` for system actions (scheduler, lazy expiry).
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    pub entity_type: AuditEntity,
    pub entity_id: Uuid,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub metadata: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        actor_id: Option<Uuid>,
        action: AuditAction,
        entity_type: AuditEntity,
        entity_id: Uuid,
        scope: Scope,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            action,
            entity_type,
            entity_id,
            school_id: scope.school_id,
            district_id: scope.district_id,
            metadata: JsonValue::Object(serde_json::Map::new()),
            occurred_at,
        }
    }

    /// Event performed by `actor`.
    #[must_use]
    pub fn by(
        actor: &Actor,
        action: AuditAction,
        entity_type: AuditEntity,
        entity_id: Uuid,
        scope: Scope,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(actor.actor_id, action, entity_type, entity_id, scope, occurred_at)
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Audit sink failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Record `event`, logging instead of failing.
pub(crate) async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!(
            action = %event.action,
            entity_id = %event.entity_id,
            error = %e,
            "Failed to record audit event"
        );
    }
}

/// Writes events to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "directory_sync_audit",
            audit_id = %event.id,
            action = %event.action,
            entity_type = event.entity_type.as_str(),
            entity_id = %event.entity_id,
            actor_id = ?event.actor_id,
            school_id = ?event.school_id,
            district_id = ?event.district_id,
            metadata = %event.metadata,
            "Directory sync audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().into_iter().map(|e| e.action).collect()
    }

    #[must_use]
    pub fn count(&self, action: AuditAction) -> usize {
        self.events().iter().filter(|e| e.action == action).count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_err(|_| AuditError::Unavailable("audit buffer poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Appends events to `directory_sync_audit_events`.
#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r"
            INSERT INTO directory_sync_audit_events (
                id, actor_id, action, entity_type, entity_id,
                school_id, district_id, metadata, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(event.id)
        .bind(event.actor_id)
        .bind(event.action.as_str())
        .bind(event.entity_type.as_str())
        .bind(event.entity_id)
        .bind(event.school_id)
        .bind(event.district_id)
        .bind(&event.metadata)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("down".to_string()))
        }
    }

    fn event(action: AuditAction) -> AuditEvent {
        AuditEvent::new(
            None,
            action,
            AuditEntity::SourceRun,
            Uuid::new_v4(),
            Scope::school(Uuid::new_v4()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_emit_swallows_sink_failures() {
        emit(&FailingSink, event(AuditAction::SyncFailed)).await;
    }

    #[tokio::test]
    async fn test_in_memory_sink_records_in_order() {
        let sink = InMemoryAuditSink::new();
        emit(&sink, event(AuditAction::SyncStarted)).await;
        emit(&sink, event(AuditAction::SyncCompleted)).await;
        assert_eq!(
            sink.actions(),
            vec![AuditAction::SyncStarted, AuditAction::SyncCompleted]
        );
        assert_eq!(sink.count(AuditAction::SyncCompleted), 1);
    }

    #[test]
    fn test_action_serializes_dotted() {
        assert_eq!(
            serde_json::to_value(AuditAction::PreviewApplied).unwrap(),
            serde_json::json!("preview.applied")
        );
        assert_eq!(AuditAction::ApprovalExpired.as_str(), "approval.expired");
    }
}

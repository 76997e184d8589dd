//! Directory sync service facade.
//!
//! One entry point over the orchestrator, approval gate and apply executor,
//! sharing a store, audit sink, clock and configuration.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::apply::{ApplyExecutor, ApplyResult};
use crate::approval::ApprovalGate;
use crate::audit::{emit, AuditAction, AuditEntity, AuditEvent, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::DirectorySyncConfig;
use crate::error::{DirectorySyncError, DirectorySyncResult};
use crate::models::{
    CreateDirectorySource, DeactivationApproval, DirectorySource, OpsSummary, Preview, SourceRun,
    SyncOptions,
};
use crate::normalizer::NormalizerRegistry;
use crate::orchestrator::{RunOrchestrator, SyncSourceResult};
use crate::scheduler::validate_schedule;
use crate::store::{CanonicalStore, SyncStore};
use crate::types::{Actor, ApprovalStatus};

/// An approval together with the preview it gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDetail {
    #[serde(flatten)]
    pub approval: DeactivationApproval,
    pub preview: Option<Preview>,
}

/// Builder for [`DirectorySyncService`].
pub struct DirectorySyncServiceBuilder {
    store: Arc<dyn SyncStore>,
    records: Arc<dyn CanonicalStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    normalizers: Option<NormalizerRegistry>,
    config: DirectorySyncConfig,
}

impl DirectorySyncServiceBuilder {
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the adapters built from the config's feed access settings.
    #[must_use]
    pub fn normalizers(mut self, normalizers: NormalizerRegistry) -> Self {
        self.normalizers = Some(normalizers);
        self
    }

    #[must_use]
    pub fn config(mut self, config: DirectorySyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> DirectorySyncService {
        let normalizers = Arc::new(
            self.normalizers
                .unwrap_or_else(|| NormalizerRegistry::from_config(&self.config)),
        );
        let gate = ApprovalGate::new(self.store.clone(), self.audit.clone(), self.clock.clone());
        let orchestrator = RunOrchestrator::new(
            self.store.clone(),
            self.records.clone(),
            normalizers.clone(),
            self.audit.clone(),
            self.clock.clone(),
            self.config.clone(),
        );
        let executor = ApplyExecutor::new(
            self.store.clone(),
            self.records,
            gate.clone(),
            self.audit.clone(),
            self.clock.clone(),
            self.config.clone(),
        );

        DirectorySyncService {
            store: self.store,
            normalizers,
            audit: self.audit,
            clock: self.clock,
            config: self.config,
            orchestrator,
            gate,
            executor,
        }
    }
}

/// Directory reconciliation service.
#[derive(Clone)]
pub struct DirectorySyncService {
    store: Arc<dyn SyncStore>,
    normalizers: Arc<NormalizerRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: DirectorySyncConfig,
    orchestrator: RunOrchestrator,
    gate: ApprovalGate,
    executor: ApplyExecutor,
}

impl DirectorySyncService {
    /// Start a builder with the built-in normalizers, the wall clock, the
    /// tracing audit sink and default configuration. Unless replaced, the
    /// normalizers follow the feed access settings of the final config.
    #[must_use]
    pub fn builder(
        store: Arc<dyn SyncStore>,
        records: Arc<dyn CanonicalStore>,
    ) -> DirectorySyncServiceBuilder {
        DirectorySyncServiceBuilder {
            store,
            records,
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
            normalizers: None,
            config: DirectorySyncConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DirectorySyncConfig {
        &self.config
    }

    // Sources

    /// Register a source inside the actor's scope.
    pub async fn create_source(
        &self,
        actor: &Actor,
        input: CreateDirectorySource,
    ) -> DirectorySyncResult<DirectorySource> {
        if input.name.trim().is_empty() {
            return Err(DirectorySyncError::Validation(
                "name must not be blank".to_string(),
            ));
        }
        let scope = input.scope();
        if !scope.is_valid() {
            return Err(DirectorySyncError::Validation(
                "a source needs a school_id or a district_id".to_string(),
            ));
        }
        if !actor.scope.covers(&scope) {
            return Err(DirectorySyncError::Validation(format!(
                "scope {scope} is outside the caller's scope"
            )));
        }
        if !self.normalizers.supports(input.source_type.trim()) {
            return Err(DirectorySyncError::Validation(format!(
                "unknown source_type '{}' (supported: {})",
                input.source_type.trim(),
                self.normalizers.source_types().join(", ")
            )));
        }
        if input.fetch_timeout_secs == Some(0) {
            return Err(DirectorySyncError::Validation(
                "fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(schedule) = &input.schedule {
            validate_schedule(schedule).map_err(|e| DirectorySyncError::Validation(e.to_string()))?;
        }

        let source = input.into_source(self.clock.now());
        if let Some(adapter) = self.normalizers.get(&source.source_type) {
            adapter
                .check_config(&source.config)
                .map_err(|e| DirectorySyncError::Validation(e.to_string()))?;
        }
        self.store.insert_source(&source).await?;

        info!(
            source_id = %source.id,
            source_type = %source.source_type,
            scope = %source.scope(),
            "Directory source created"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                AuditAction::SourceCreated,
                AuditEntity::DirectorySource,
                source.id,
                source.scope(),
                source.created_at,
            )
            .with_metadata(json!({
                "name": source.name,
                "source_type": source.source_type,
                "record_types": source.record_types,
                "scheduled": source.schedule.is_some(),
            })),
        )
        .await;

        Ok(source)
    }

    pub async fn list_sources(&self, actor: &Actor) -> DirectorySyncResult<Vec<DirectorySource>> {
        Ok(self.store.list_sources(&actor.scope).await?)
    }

    pub async fn get_source(
        &self,
        actor: &Actor,
        source_id: Uuid,
    ) -> DirectorySyncResult<DirectorySource> {
        self.orchestrator.load_source(actor, source_id).await
    }

    /// Enable or soft-disable a source.
    pub async fn set_source_enabled(
        &self,
        actor: &Actor,
        source_id: Uuid,
        enabled: bool,
    ) -> DirectorySyncResult<DirectorySource> {
        let source = self.orchestrator.load_source(actor, source_id).await?;
        if source.enabled == enabled {
            return Ok(source);
        }

        let now = self.clock.now();
        let source = self
            .store
            .set_source_enabled(source_id, enabled, now)
            .await?
            .ok_or(DirectorySyncError::SourceNotFound { source_id })?;

        info!(source_id = %source_id, enabled, "Directory source toggled");
        let action = if enabled {
            AuditAction::SourceEnabled
        } else {
            AuditAction::SourceDisabled
        };
        emit(
            self.audit.as_ref(),
            AuditEvent::by(
                actor,
                action,
                AuditEntity::DirectorySource,
                source.id,
                source.scope(),
                now,
            ),
        )
        .await;

        Ok(source)
    }

    /// Enabled, scheduled sources across every scope. Used by the scheduler.
    pub async fn list_scheduled_sources(&self) -> DirectorySyncResult<Vec<DirectorySource>> {
        Ok(self.store.list_scheduled_sources().await?)
    }

    // Runs

    pub async fn sync_source(
        &self,
        actor: &Actor,
        source_id: Uuid,
        options: SyncOptions,
    ) -> DirectorySyncResult<SyncSourceResult> {
        // Runs on its own task so a dropped caller (client disconnect) cannot
        // leave the run half-finished.
        let orchestrator = self.orchestrator.clone();
        let actor = *actor;
        tokio::spawn(async move { orchestrator.sync_source(&actor, source_id, options).await })
            .await
            .map_err(|e| DirectorySyncError::Internal(format!("Sync task failed: {e}")))?
    }

    pub async fn list_runs(
        &self,
        actor: &Actor,
        source_id: Uuid,
        limit: Option<usize>,
    ) -> DirectorySyncResult<Vec<SourceRun>> {
        let limit = self.config.clamp_list_limit(limit);
        self.orchestrator.list_runs(actor, source_id, limit).await
    }

    pub async fn get_run(&self, actor: &Actor, run_id: Uuid) -> DirectorySyncResult<SourceRun> {
        self.orchestrator.get_run(actor, run_id).await
    }

    pub async fn get_preview(&self, actor: &Actor, preview_id: Uuid) -> DirectorySyncResult<Preview> {
        self.store
            .get_preview(preview_id)
            .await?
            .filter(|p| actor.can_access(p.school_id, p.district_id))
            .ok_or(DirectorySyncError::PreviewNotFound { preview_id })
    }

    // Approvals

    pub async fn list_approvals(
        &self,
        actor: &Actor,
        status: Option<ApprovalStatus>,
        limit: Option<usize>,
    ) -> DirectorySyncResult<Vec<DeactivationApproval>> {
        let limit = self.config.clamp_list_limit(limit);
        self.gate.list(actor, status, limit).await
    }

    /// Approval with its effective status and preview.
    pub async fn get_approval(
        &self,
        actor: &Actor,
        approval_id: Uuid,
    ) -> DirectorySyncResult<ApprovalDetail> {
        let approval = self.gate.get(actor, approval_id).await?;
        let preview = self.store.get_preview(approval.preview_id).await?;
        Ok(ApprovalDetail { approval, preview })
    }

    pub async fn approve(
        &self,
        actor: &Actor,
        approval_id: Uuid,
        reason: Option<String>,
    ) -> DirectorySyncResult<DeactivationApproval> {
        self.gate.approve(actor, approval_id, reason).await
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        approval_id: Uuid,
        reason: &str,
    ) -> DirectorySyncResult<DeactivationApproval> {
        self.gate.reject(actor, approval_id, reason).await
    }

    // Apply

    pub async fn apply(&self, actor: &Actor, approval_id: Uuid) -> DirectorySyncResult<ApplyResult> {
        self.executor.apply(actor, approval_id).await
    }

    pub async fn apply_preview(
        &self,
        actor: &Actor,
        preview_id: Uuid,
    ) -> DirectorySyncResult<ApplyResult> {
        self.executor.apply_preview(actor, preview_id).await
    }

    // Ops

    pub async fn get_ops_summary(&self, actor: &Actor) -> DirectorySyncResult<OpsSummary> {
        Ok(self
            .store
            .ops_summary(&actor.scope, self.clock.now())
            .await?)
    }
}

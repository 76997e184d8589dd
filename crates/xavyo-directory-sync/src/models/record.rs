//! Canonical staff/student records the pipeline reconciles into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::types::{RecordType, Scope};

/// A staff or student record in the canonical directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub external_id: String,
    pub record_type: RecordType,
    pub school_id: Option<Uuid>,
    pub district_id: Option<Uuid>,
    pub fields: Map<String, JsonValue>,
    pub active: bool,
    /// Source that last wrote the record.
    pub source_id: Option<Uuid>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Create an active record.
    #[must_use]
    pub fn new(
        external_id: impl Into<String>,
        record_type: RecordType,
        scope: Scope,
        fields: Map<String, JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            record_type,
            school_id: scope.school_id,
            district_id: scope.district_id,
            fields,
            active: true,
            source_id: None,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::new(self.school_id, self.district_id)
    }

    /// Human-readable label for review screens.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        let text = |key: &str| {
            self.fields
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        if let Some(name) = text("display_name") {
            return Some(name.to_string());
        }
        match (text("first_name"), text("last_name")) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
            (None, None) => text("email").map(str::to_string),
        }
    }

    /// Merge an upsert into this record and reactivate it.
    pub fn apply_upsert(&mut self, upsert: &RecordUpsert, now: DateTime<Utc>) {
        for (key, value) in &upsert.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        self.record_type = upsert.record_type;
        self.active = true;
        self.deactivated_at = None;
        self.source_id = upsert.source_id.or(self.source_id);
        self.updated_at = now;
    }
}

/// An idempotent create-or-merge keyed by external id within a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpsert {
    pub external_id: String,
    pub record_type: RecordType,
    /// Fields to set; fields not listed are left alone.
    pub fields: Map<String, JsonValue>,
    pub source_id: Option<Uuid>,
}

//! Aggregate operational counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counts across sources, runs, approvals and applies visible in one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsSummary {
    pub sources_total: u32,
    pub sources_enabled: u32,
    /// Keyed by run status string.
    pub runs_by_status: BTreeMap<String, u32>,
    /// Keyed by effective approval status string.
    pub approvals_by_status: BTreeMap<String, u32>,
    pub previews_total: u32,
    pub previews_applied: u32,
    /// Records written by completed applies.
    pub applied_upserts: u64,
    pub applied_deactivations: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

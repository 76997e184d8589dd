//! Common types for directory synchronization.
//!
//! Status enums follow the same string conventions as the database columns
//! (`snake_case`), so `as_str` / `FromStr` round-trip through storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The school/district boundary an actor or entity belongs to.
///
/// A scope is valid when at least one of the two identifiers is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Scope {
    /// School identifier.
    #[serde(default)]
    pub school_id: Option<Uuid>,
    /// District identifier.
    #[serde(default)]
    pub district_id: Option<Uuid>,
}

impl Scope {
    /// Build a scope from optional school and district identifiers.
    #[must_use]
    pub fn new(school_id: Option<Uuid>, district_id: Option<Uuid>) -> Self {
        Self {
            school_id,
            district_id,
        }
    }

    /// School-only scope.
    #[must_use]
    pub fn school(school_id: Uuid) -> Self {
        Self::new(Some(school_id), None)
    }

    /// District-only scope.
    #[must_use]
    pub fn district(district_id: Uuid) -> Self {
        Self::new(None, Some(district_id))
    }

    /// Whether at least one identifier is present.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.school_id.is_some() || self.district_id.is_some()
    }

    /// Whether an entity tagged with the given identifiers falls inside this scope.
    ///
    /// Every identifier set on `self` must match the entity's identifier.
    /// An invalid (empty) scope contains nothing.
    #[must_use]
    pub fn contains(&self, school_id: Option<Uuid>, district_id: Option<Uuid>) -> bool {
        if !self.is_valid() {
            return false;
        }
        let school_ok = self.school_id.map_or(true, |id| school_id == Some(id));
        let district_ok = self.district_id.map_or(true, |id| district_id == Some(id));
        school_ok && district_ok
    }

    /// Whether `other` is fully inside this scope.
    #[must_use]
    pub fn covers(&self, other: &Scope) -> bool {
        self.contains(other.school_id, other.district_id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.school_id, self.district_id) {
            (Some(school), Some(district)) => write!(f, "school:{school}/district:{district}"),
            (Some(school), None) => write!(f, "school:{school}"),
            (None, Some(district)) => write!(f, "district:{district}"),
            (None, None) => write!(f, "unscoped"),
        }
    }
}

/// Who is performing an operation.
///
/// Scheduled runs use [`Actor::system`], which has no actor id but carries
/// the scope of the source being synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Acting user, `None` for the scheduler.
    pub actor_id: Option<Uuid>,
    /// Scope the actor is allowed to touch.
    pub scope: Scope,
}

impl Actor {
    /// A user actor.
    #[must_use]
    pub fn new(actor_id: Uuid, scope: Scope) -> Self {
        Self {
            actor_id: Some(actor_id),
            scope,
        }
    }

    /// The system actor used for scheduled runs.
    #[must_use]
    pub fn system(scope: Scope) -> Self {
        Self {
            actor_id: None,
            scope,
        }
    }

    /// Check whether the actor may see an entity with the given identifiers.
    #[must_use]
    pub fn can_access(&self, school_id: Option<Uuid>, district_id: Option<Uuid>) -> bool {
        self.scope.contains(school_id, district_id)
    }
}

/// Kind of person a canonical record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// Teachers, administrators and other staff members.
    Staff,
    /// Enrolled students.
    Student,
}

impl RecordType {
    /// All record types, in apply order.
    pub const ALL: [RecordType; 2] = [RecordType::Staff, RecordType::Student];

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Staff => "staff",
            RecordType::Student => "student",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "staff" | "teacher" => Ok(RecordType::Staff),
            "student" => Ok(RecordType::Student),
            _ => Err(format!("Unknown record type: {s}")),
        }
    }
}

/// Lifecycle status of a source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted, not started yet.
    Queued,
    /// Fetching, normalizing and diffing.
    Running,
    /// Preview persisted.
    Succeeded,
    /// Fatal failure; no preview was produced.
    Failed,
}

impl RunStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    /// Whether a run in this status blocks new runs for the same source.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// Status of a deactivation approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; apply is allowed until expiry.
    Approved,
    /// Rejected; apply is never allowed.
    Rejected,
    /// Expired before a decision or an apply happened.
    Expired,
}

impl ApprovalStatus {
    /// All statuses.
    pub const ALL: [ApprovalStatus; 4] = [
        ApprovalStatus::Pending,
        ApprovalStatus::Approved,
        ApprovalStatus::Rejected,
        ApprovalStatus::Expired,
    ];

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    /// Whether no further decision can be made.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// Allowed transitions. Only `pending` has outgoing edges.
    #[must_use]
    pub fn can_transition_to(&self, target: ApprovalStatus) -> bool {
        matches!(
            (self, target),
            (
                ApprovalStatus::Pending,
                ApprovalStatus::Approved | ApprovalStatus::Rejected | ApprovalStatus::Expired
            )
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            _ => Err(format!("Unknown approval status: {s}")),
        }
    }
}

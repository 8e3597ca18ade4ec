//! Fan-in joins: aggregates that track completion of a set of work items.
//!
//! A join expects a fixed number of steps. Each member work item reports
//! completion or failure exactly once (per member, not per call), and once
//! `completed + failed` reaches `expected`, the `join.wait` handler fires the
//! follow-up work.
//!
//! Members are modeled as independent rows with a composite key; a work item
//! may belong to multiple joins, and the member row (not the work item)
//! carries the counted-state, which is what makes counter increments
//! idempotent across retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MailroomError, Result};
use crate::item::WorkItemId;

// ============================================================================
// Model
// ============================================================================

/// Unique identity of a join aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinId(Uuid);

impl JoinId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for JoinId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JoinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Pending => "pending",
            JoinStatus::Completed => "completed",
            JoinStatus::Failed => "failed",
            JoinStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JoinStatus {
    type Err = MailroomError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JoinStatus::Pending),
            "completed" => Ok(JoinStatus::Completed),
            "failed" => Ok(JoinStatus::Failed),
            "cancelled" => Ok(JoinStatus::Cancelled),
            other => Err(MailroomError::Validation(format!(
                "unknown join status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A join aggregate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Join {
    pub id: JoinId,
    /// Joins are tenant-local; the id scopes them.
    pub tenant_id: String,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: JoinStatus,
    /// Opaque text, typically JSON.
    pub metadata: Option<String>,
    pub created_on: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
}

impl Join {
    /// True once every expected step has reported completion or failure.
    pub fn is_settled(&self) -> bool {
        self.completed_steps + self.failed_steps >= self.expected_steps
    }
}

/// Counted-state of a member; flips exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Pending => "pending",
            MemberState::Completed => "completed",
            MemberState::Failed => "failed",
        }
    }

    pub fn is_counted(&self) -> bool {
        !matches!(self, MemberState::Pending)
    }
}

impl std::str::FromStr for MemberState {
    type Err = MailroomError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MemberState::Pending),
            "completed" => Ok(MemberState::Completed),
            "failed" => Ok(MemberState::Failed),
            other => Err(MailroomError::Validation(format!(
                "unknown member state: {other}"
            ))),
        }
    }
}

/// Link between one work item and one join; primary key `(join_id, work_item_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMember {
    pub join_id: JoinId,
    pub work_item_id: WorkItemId,
    pub state: MemberState,
    pub created_on: DateTime<Utc>,
}

// ============================================================================
// Store
// ============================================================================

/// Persistence contract for joins and their member links.
///
/// Ack and Fail on the work-item store drive the automatic counting path:
/// they apply the same member-flip-then-increment inside the work-item
/// transaction. The standalone `increment_*` operations here exist for the
/// manual path, when membership is established only after the work item has
/// already been acked; both paths share the per-member idempotence, so they
/// can coexist without diverging counters.
#[async_trait]
pub trait JoinStore: Send + Sync {
    /// Create a join. `expected_steps` must be at least 1.
    async fn create_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId>;

    /// Link a work item to a join. Idempotent.
    async fn attach(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<()>;

    /// Count a member as completed, if it has not been counted yet.
    ///
    /// Returns true when this call performed the increment. Counters clamp
    /// at `expected_steps`.
    async fn increment_completed(&self, join_id: JoinId, work_item_id: &WorkItemId)
        -> Result<bool>;

    /// Count a member as failed, if it has not been counted yet.
    async fn increment_failed(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<bool>;

    /// Set the join status and bump `last_updated_on`.
    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()>;

    async fn get_join(&self, join_id: JoinId) -> Result<Join>;

    async fn get_members(&self, join_id: JoinId) -> Result<Vec<JoinMember>>;
}

/// Validate `expected_steps` before it reaches a backend.
pub fn validate_expected_steps(expected_steps: i32) -> Result<()> {
    if expected_steps < 1 {
        return Err(MailroomError::Validation(format!(
            "expected_steps must be at least 1, got {expected_steps}"
        )));
    }
    Ok(())
}

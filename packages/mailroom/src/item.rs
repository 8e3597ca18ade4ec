//! Work-item model: the unit of dispatch.
//!
//! A work item is one row in a queue table. Inbox and outbox rows share this
//! canonical shape; inbox rows additionally carry a `source` and an optional
//! payload `hash` for dedup integrity, and their ids are externally supplied
//! dedup keys rather than generated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::MailroomError;

/// Maximum accepted topic length, enforced at enqueue.
pub const MAX_TOPIC_LEN: usize = 255;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable unique identity of a work item.
///
/// Opaque text: outbox ids are generated 128-bit values
/// ([`WorkItemId::random`]); inbox ids are supplied by the caller and double
/// as the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    /// Wrap an externally supplied id (the inbox dedup path).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 128-bit id (the outbox path).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Fencing credential minted once per dispatcher iteration.
///
/// The store only honors Ack/Abandon/Fail from the token that holds the
/// lease; everyone else silently no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Mint a fresh random 128-bit token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for OwnerToken {
    fn from(token: Uuid) -> Self {
        Self(token)
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Work-item lifecycle: `Ready → Processing → (Done | Ready | Dead)`.
///
/// `Revive` is the operator-initiated `Dead → Ready` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Eligible for claiming once `due_on` (if any) has passed.
    #[default]
    Ready,
    /// Leased by an owner until `locked_until`.
    Processing,
    /// Terminal success; never re-claimed.
    Done,
    /// Terminal failure; never re-claimed until revived.
    Dead,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Ready => "ready",
            WorkItemStatus::Processing => "processing",
            WorkItemStatus::Done => "done",
            WorkItemStatus::Dead => "dead",
        }
    }

    /// True for states the cleanup scan may delete.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Done | WorkItemStatus::Dead)
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = MailroomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(WorkItemStatus::Ready),
            "processing" => Ok(WorkItemStatus::Processing),
            "done" => Ok(WorkItemStatus::Done),
            "dead" => Ok(WorkItemStatus::Dead),
            other => Err(MailroomError::Validation(format!(
                "unknown work item status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Work Item
// ============================================================================

/// A persisted work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,

    /// Routing key to the handler; matched case-insensitively.
    pub topic: String,

    /// Opaque payload, treated as text in SQL.
    pub payload: String,

    /// Propagated to handlers and follow-up enqueues.
    pub correlation_id: Option<String>,

    /// Origin system identifier (inbox only); part of dedup grouping.
    pub source: Option<String>,

    /// Optional payload fingerprint (inbox only).
    pub hash: Option<String>,

    pub status: WorkItemStatus,

    /// 0 on insert; incremented on each abandon. Lease expiry does not count.
    pub attempt_count: i32,

    /// Wall-clock lease deadline; null when not leased.
    pub locked_until: Option<DateTime<Utc>>,

    /// Current lease holder; null when not leased.
    pub owner_token: Option<Uuid>,

    /// Earliest claimable time; null means immediately.
    pub due_on: Option<DateTime<Utc>>,

    pub created_on: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
    pub last_error: Option<String>,
}

impl WorkItem {
    /// True when the lease has expired relative to `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(deadline) if deadline <= now)
    }

    /// Claim eligibility: `Ready` (or expired-lease `Processing`) and due.
    ///
    /// A `due_on` in the past is equivalent to no `due_on` at all.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let state_ok = match self.status {
            WorkItemStatus::Ready => true,
            WorkItemStatus::Processing => self.lease_expired(now),
            WorkItemStatus::Done | WorkItemStatus::Dead => false,
        };
        state_ok && self.due_on.map_or(true, |due| due <= now)
    }
}

// ============================================================================
// Enqueue
// ============================================================================

/// Input to `WorkItemStore::enqueue`.
///
/// # Example
///
/// ```ignore
/// let item = NewWorkItem::new("email.send", r#"{"to":"a@b.c"}"#)
///     .correlation_id("req-42")
///     .due_in(Duration::from_secs(30));
/// store.enqueue(item).await?;
/// ```
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub topic: String,
    pub payload: String,
    /// Explicit id; supplied for inbox rows (dedup key), generated otherwise.
    pub id: Option<WorkItemId>,
    pub correlation_id: Option<String>,
    pub due_on: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub hash: Option<String>,
}

impl NewWorkItem {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            id: None,
            correlation_id: None,
            due_on: None,
            source: None,
            hash: None,
        }
    }

    pub fn id(mut self, id: WorkItemId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn due_on(mut self, due_on: DateTime<Utc>) -> Self {
        self.due_on = Some(due_on);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Stamp the item with a SHA-256 fingerprint of its payload.
    pub fn hashed(mut self) -> Self {
        let digest = Sha256::digest(self.payload.as_bytes());
        self.hash = Some(format!("{digest:x}"));
        self
    }

    /// Enqueue-time validation; stores call this before touching the backend.
    pub fn validate(&self) -> Result<(), MailroomError> {
        if self.topic.trim().is_empty() {
            return Err(MailroomError::Validation("topic must not be empty".into()));
        }
        if self.topic.len() > MAX_TOPIC_LEN {
            return Err(MailroomError::Validation(format!(
                "topic exceeds {MAX_TOPIC_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Outcome of an enqueue that may hit the inbox dedup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new row was inserted.
    Created(WorkItemId),
    /// A row with the supplied id already exists; nothing was written.
    Duplicate(WorkItemId),
}

impl EnqueueResult {
    /// The item id regardless of whether it was created or already present.
    pub fn item_id(&self) -> &WorkItemId {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_distinct() {
        assert_ne!(WorkItemId::random(), WorkItemId::random());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkItemStatus::Ready,
            WorkItemStatus::Processing,
            WorkItemStatus::Done,
            WorkItemStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<WorkItemStatus>().unwrap(), status);
        }
        assert!("pending".parse::<WorkItemStatus>().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let item = NewWorkItem::new("", "{}");
        assert!(matches!(
            item.validate(),
            Err(MailroomError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_topic() {
        let item = NewWorkItem::new("t".repeat(MAX_TOPIC_LEN + 1), "{}");
        assert!(item.validate().is_err());
        let item = NewWorkItem::new("t".repeat(MAX_TOPIC_LEN), "{}");
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_hashed_fingerprints_payload() {
        let a = NewWorkItem::new("email.send", "{}").hashed();
        let b = NewWorkItem::new("email.send", "{}").hashed();
        let c = NewWorkItem::new("email.send", "{ }").hashed();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_claimable_respects_due_and_lease() {
        let now = Utc::now();
        let mut item = WorkItem {
            id: WorkItemId::random(),
            topic: "email.send".into(),
            payload: "{}".into(),
            correlation_id: None,
            source: None,
            hash: None,
            status: WorkItemStatus::Ready,
            attempt_count: 0,
            locked_until: None,
            owner_token: None,
            due_on: None,
            created_on: now,
            processed_on: None,
            processed_by: None,
            last_error: None,
        };
        assert!(item.is_claimable(now));

        // Due in the future blocks the claim; due in the past is as-if-null.
        item.due_on = Some(now + chrono::Duration::seconds(10));
        assert!(!item.is_claimable(now));
        item.due_on = Some(now - chrono::Duration::seconds(10));
        assert!(item.is_claimable(now));

        // A live lease blocks; an expired one does not.
        item.due_on = None;
        item.status = WorkItemStatus::Processing;
        item.locked_until = Some(now + chrono::Duration::seconds(30));
        assert!(!item.is_claimable(now));
        item.locked_until = Some(now - chrono::Duration::seconds(1));
        assert!(item.is_claimable(now));

        item.status = WorkItemStatus::Done;
        assert!(!item.is_claimable(now));
    }

    #[test]
    fn test_enqueue_result_helpers() {
        let id = WorkItemId::random();
        let created = EnqueueResult::Created(id.clone());
        assert!(created.is_created());
        assert_eq!(created.item_id(), &id);

        let duplicate = EnqueueResult::Duplicate(id.clone());
        assert!(!duplicate.is_created());
    }
}

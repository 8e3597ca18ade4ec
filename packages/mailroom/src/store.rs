//! The work-item store contract.
//!
//! The store is the single source of truth for work-item state and the only
//! component that performs the atomic transitions. Backends run every
//! mutating operation in a single database transaction with non-blocking
//! skip-locked claim semantics, so concurrent workers never block and never
//! receive the same row.
//!
//! # Ownership discipline
//!
//! Every mutation except `enqueue`, `revive`, `reap_expired`, and `cleanup`
//! requires the caller's [`OwnerToken`] to match the row. The backend
//! enforces the match in the same statement that performs the transition, so
//! Ack/Abandon/Fail never need to re-verify the lease first: a stale worker
//! colliding with the reaper loses quietly, whoever holds the current token
//! wins.
//!
//! # Cancellation
//!
//! Operations are plain futures; dropping one abandons the round-trip. The
//! polling services check their `CancellationToken` between operations, which
//! is where cancellation is observed.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::item::{EnqueueResult, NewWorkItem, OwnerToken, WorkItem, WorkItemId};

/// Persistence contract for one queue table (one store).
///
/// All operations except `enqueue` are idempotent on no-op inputs: acking an
/// unknown id, reaping with nothing expired, or reviving a row that is not
/// `Dead` changes nothing and returns success.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Insert a new `Ready` row with `attempt_count = 0`.
    ///
    /// Generates a fresh id unless the caller supplied one; a supplied id
    /// that already exists yields [`EnqueueResult::Duplicate`] without
    /// writing (the inbox dedup path). Validates per
    /// [`NewWorkItem::validate`].
    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult>;

    /// Atomically lease up to `batch_size` eligible rows for `owner`.
    ///
    /// Eligible means `Ready` or expired-lease `Processing`, with `due_on`
    /// null or past. Rows are taken in `created_on` order; rows locked by
    /// concurrent transactions are skipped, not waited on. Returns the ids
    /// of the rows transitioned to `Processing`, which may be empty.
    async fn claim(
        &self,
        owner: &OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<WorkItemId>>;

    /// Finish rows successfully: `Processing → Done`.
    ///
    /// Only rows whose current owner matches are touched; others are
    /// silently skipped. Within the same transaction, increments
    /// `completed_steps` on every join each acked item belongs to, once per
    /// member.
    async fn ack(&self, owner: &OwnerToken, worker_id: &str, ids: &[WorkItemId]) -> Result<()>;

    /// Return rows to the queue for retry: `Processing → Ready`.
    ///
    /// Increments `attempt_count`, records `last_error` when supplied, and
    /// sets `due_on = now + delay` when a delay is supplied (otherwise the
    /// row is immediately claimable). Ownership-checked like `ack`.
    async fn abandon(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Park rows permanently: `Processing → Dead`.
    ///
    /// Records the reason in `last_error` and stamps `processed_by` with
    /// `"{worker_id}:FAILED"`. Within the same transaction, increments
    /// `failed_steps` on associated joins, once per member. Ownership-checked.
    async fn fail(
        &self,
        owner: &OwnerToken,
        worker_id: &str,
        ids: &[WorkItemId],
        reason: &str,
    ) -> Result<()>;

    /// Heartbeat: push `locked_until` forward for rows the owner still
    /// holds. Ownership-checked; rows already finished or re-claimed are
    /// silently skipped.
    ///
    /// Long-running handlers stay leased through this; the dispatcher beats
    /// on the handler's behalf while it runs.
    async fn extend_lease(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        lease: Duration,
    ) -> Result<()>;

    /// Operator action: `Dead → Ready`, token-agnostic.
    ///
    /// Preserves `attempt_count`; replaces `last_error` only when a reason
    /// is supplied; sets `due_on = now + delay` when a delay is supplied.
    async fn revive(
        &self,
        ids: &[WorkItemId],
        reason: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Release expired leases: `Processing → Ready` where `locked_until` has
    /// passed. Returns the number of rows released.
    ///
    /// Does not touch `attempt_count`: lease expiry is an infrastructure
    /// event, not a handler failure.
    async fn reap_expired(&self) -> Result<u64>;

    /// Read a full row. Errors with `NotFound` for unknown ids.
    async fn get(&self, id: &WorkItemId) -> Result<WorkItem>;

    /// Delete terminal rows whose `processed_on` is older than `retention`.
    /// Returns the number of rows deleted.
    async fn cleanup(&self, retention: Duration) -> Result<u64>;
}

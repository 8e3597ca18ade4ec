//! In-memory store and handler doubles for tests.
//!
//! [`InMemoryStore`] implements the full [`WorkItemStore`] + [`JoinStore`]
//! contract — claim eligibility, ownership discipline, per-member counter
//! idempotence — against a [`Clock`] so tests can steer time instead of
//! sleeping. It is deterministic and lock-based; it is not a benchmark
//! subject.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::{MailroomError, Result};
use crate::handler::{Handler, HandlerContext};
use crate::item::{
    EnqueueResult, NewWorkItem, OwnerToken, WorkItem, WorkItemId, WorkItemStatus,
};
use crate::join::{
    validate_expected_steps, Join, JoinId, JoinMember, JoinStatus, JoinStore, MemberState,
};
use crate::store::WorkItemStore;

// ============================================================================
// In-memory store
// ============================================================================

struct Entry {
    item: WorkItem,
    /// Tie-breaker for claims enqueued at the same instant.
    seq: u64,
}

#[derive(Default)]
struct State {
    items: HashMap<WorkItemId, Entry>,
    joins: HashMap<JoinId, Join>,
    members: HashMap<JoinId, BTreeMap<WorkItemId, MemberState>>,
    next_seq: u64,
}

/// A process-local store honoring the durable-store contract.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// Every item, in insertion order. Test inspection only.
    pub fn all_items(&self) -> Vec<WorkItem> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<&Entry> = state.items.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.item.clone()).collect()
    }

    /// Items currently in `status`, in insertion order.
    pub fn items_with_status(&self, status: WorkItemStatus) -> Vec<WorkItem> {
        self.all_items()
            .into_iter()
            .filter(|item| item.status == status)
            .collect()
    }

    /// Items routed to `topic` (case-insensitive), in insertion order.
    pub fn items_with_topic(&self, topic: &str) -> Vec<WorkItem> {
        self.all_items()
            .into_iter()
            .filter(|item| item.topic.eq_ignore_ascii_case(topic))
            .collect()
    }

    fn now_plus(&self, delay: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| self.clock.now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Flip pending members of `work_item_id` to `to`, bumping the matching
    /// join counter with the clamp. Shared by ack/fail and the manual
    /// report path.
    fn count_member(state: &mut State, join_id: JoinId, work_item_id: &WorkItemId, to: MemberState, now: DateTime<Utc>) -> bool {
        let Some(members) = state.members.get_mut(&join_id) else {
            return false;
        };
        let Some(member_state) = members.get_mut(work_item_id) else {
            return false;
        };
        if member_state.is_counted() {
            return false;
        }
        *member_state = to;

        let Some(join) = state.joins.get_mut(&join_id) else {
            return false;
        };
        match to {
            MemberState::Completed => {
                join.completed_steps =
                    (join.completed_steps + 1).min(join.expected_steps - join.failed_steps);
            }
            MemberState::Failed => {
                join.failed_steps =
                    (join.failed_steps + 1).min(join.expected_steps - join.completed_steps);
            }
            MemberState::Pending => unreachable!("count_member never flips to pending"),
        }
        join.last_updated_on = now;
        true
    }

    /// Joins this work item is a member of.
    fn joins_of(state: &State, work_item_id: &WorkItemId) -> Vec<JoinId> {
        state
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(work_item_id))
            .map(|(join_id, _)| *join_id)
            .collect()
    }
}

#[async_trait]
impl WorkItemStore for InMemoryStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult> {
        item.validate()?;
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let id = item.id.clone().unwrap_or_else(WorkItemId::random);
        if state.items.contains_key(&id) {
            return Ok(EnqueueResult::Duplicate(id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.items.insert(
            id.clone(),
            Entry {
                item: WorkItem {
                    id: id.clone(),
                    topic: item.topic,
                    payload: item.payload,
                    correlation_id: item.correlation_id,
                    source: item.source,
                    hash: item.hash,
                    status: WorkItemStatus::Ready,
                    attempt_count: 0,
                    locked_until: None,
                    owner_token: None,
                    due_on: item.due_on,
                    created_on: now,
                    processed_on: None,
                    processed_by: None,
                    last_error: None,
                },
                seq,
            },
        );
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(
        &self,
        owner: &OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<WorkItemId>> {
        let now = self.clock.now();
        let deadline = self.now_plus(lease);
        let mut state = self.state.lock().unwrap();

        let mut eligible: Vec<(DateTime<Utc>, u64, WorkItemId)> = state
            .items
            .values()
            .filter(|entry| entry.item.is_claimable(now))
            .map(|entry| (entry.item.created_on, entry.seq, entry.item.id.clone()))
            .collect();
        eligible.sort();
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, id) in eligible {
            let entry = state.items.get_mut(&id).unwrap();
            entry.item.status = WorkItemStatus::Processing;
            entry.item.owner_token = Some(owner.as_uuid());
            entry.item.locked_until = Some(deadline);
            claimed.push(id);
        }
        Ok(claimed)
    }

    async fn ack(&self, owner: &OwnerToken, worker_id: &str, ids: &[WorkItemId]) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        for id in ids {
            let owned = matches!(
                state.items.get(id),
                Some(entry)
                    if entry.item.status == WorkItemStatus::Processing
                        && entry.item.owner_token == Some(owner.as_uuid())
            );
            if !owned {
                continue;
            }

            let entry = state.items.get_mut(id).unwrap();
            entry.item.status = WorkItemStatus::Done;
            entry.item.processed_on = Some(now);
            entry.item.processed_by = Some(worker_id.to_string());
            entry.item.owner_token = None;
            entry.item.locked_until = None;

            for join_id in Self::joins_of(&state, id) {
                Self::count_member(&mut state, join_id, id, MemberState::Completed, now);
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        let due_on = delay.map(|d| self.now_plus(d));
        let mut state = self.state.lock().unwrap();

        for id in ids {
            let Some(entry) = state.items.get_mut(id) else {
                continue;
            };
            if entry.item.status != WorkItemStatus::Processing
                || entry.item.owner_token != Some(owner.as_uuid())
            {
                continue;
            }
            entry.item.status = WorkItemStatus::Ready;
            entry.item.attempt_count += 1;
            if let Some(error) = last_error {
                entry.item.last_error = Some(error.to_string());
            }
            entry.item.due_on = due_on;
            entry.item.owner_token = None;
            entry.item.locked_until = None;
        }
        Ok(())
    }

    async fn fail(
        &self,
        owner: &OwnerToken,
        worker_id: &str,
        ids: &[WorkItemId],
        reason: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        for id in ids {
            let owned = matches!(
                state.items.get(id),
                Some(entry)
                    if entry.item.status == WorkItemStatus::Processing
                        && entry.item.owner_token == Some(owner.as_uuid())
            );
            if !owned {
                continue;
            }

            let entry = state.items.get_mut(id).unwrap();
            entry.item.status = WorkItemStatus::Dead;
            entry.item.last_error = Some(reason.to_string());
            entry.item.processed_on = Some(now);
            entry.item.processed_by = Some(format!("{worker_id}:FAILED"));
            entry.item.owner_token = None;
            entry.item.locked_until = None;

            for join_id in Self::joins_of(&state, id) {
                Self::count_member(&mut state, join_id, id, MemberState::Failed, now);
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        lease: Duration,
    ) -> Result<()> {
        let deadline = self.now_plus(lease);
        let mut state = self.state.lock().unwrap();

        for id in ids {
            let Some(entry) = state.items.get_mut(id) else {
                continue;
            };
            if entry.item.status != WorkItemStatus::Processing
                || entry.item.owner_token != Some(owner.as_uuid())
            {
                continue;
            }
            entry.item.locked_until = Some(deadline);
        }
        Ok(())
    }

    async fn revive(
        &self,
        ids: &[WorkItemId],
        reason: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        let due_on = delay.map(|d| self.now_plus(d));
        let mut state = self.state.lock().unwrap();

        for id in ids {
            let Some(entry) = state.items.get_mut(id) else {
                continue;
            };
            if entry.item.status != WorkItemStatus::Dead {
                continue;
            }
            entry.item.status = WorkItemStatus::Ready;
            entry.item.owner_token = None;
            entry.item.locked_until = None;
            entry.item.due_on = due_on;
            if let Some(reason) = reason {
                entry.item.last_error = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let mut released = 0;
        for entry in state.items.values_mut() {
            if entry.item.status == WorkItemStatus::Processing && entry.item.lease_expired(now) {
                entry.item.status = WorkItemStatus::Ready;
                entry.item.owner_token = None;
                entry.item.locked_until = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: &WorkItemId) -> Result<WorkItem> {
        let state = self.state.lock().unwrap();
        state
            .items
            .get(id)
            .map(|entry| entry.item.clone())
            .ok_or_else(|| MailroomError::NotFound(format!("work item {id}")))
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| self.clock.now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.state.lock().unwrap();

        let doomed: Vec<WorkItemId> = state
            .items
            .values()
            .filter(|entry| {
                entry.item.status.is_terminal()
                    && matches!(entry.item.processed_on, Some(at) if at < cutoff)
            })
            .map(|entry| entry.item.id.clone())
            .collect();
        for id in &doomed {
            state.items.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl JoinStore for InMemoryStore {
    async fn create_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId> {
        validate_expected_steps(expected_steps)?;
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let id = JoinId::random();
        state.joins.insert(
            id,
            Join {
                id,
                tenant_id: tenant_id.to_string(),
                expected_steps,
                completed_steps: 0,
                failed_steps: 0,
                status: JoinStatus::Pending,
                metadata: metadata.map(str::to_string),
                created_on: now,
                last_updated_on: now,
            },
        );
        state.members.insert(id, BTreeMap::new());
        Ok(id)
    }

    async fn attach(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let members = state
            .members
            .get_mut(&join_id)
            .ok_or_else(|| MailroomError::NotFound(format!("join {join_id}")))?;
        members
            .entry(work_item_id.clone())
            .or_insert(MemberState::Pending);
        Ok(())
    }

    async fn increment_completed(
        &self,
        join_id: JoinId,
        work_item_id: &WorkItemId,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        Ok(Self::count_member(
            &mut state,
            join_id,
            work_item_id,
            MemberState::Completed,
            now,
        ))
    }

    async fn increment_failed(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        Ok(Self::count_member(
            &mut state,
            join_id,
            work_item_id,
            MemberState::Failed,
            now,
        ))
    }

    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let join = state
            .joins
            .get_mut(&join_id)
            .ok_or_else(|| MailroomError::NotFound(format!("join {join_id}")))?;
        join.status = status;
        join.last_updated_on = now;
        Ok(())
    }

    async fn get_join(&self, join_id: JoinId) -> Result<Join> {
        let state = self.state.lock().unwrap();
        state
            .joins
            .get(&join_id)
            .cloned()
            .ok_or_else(|| MailroomError::NotFound(format!("join {join_id}")))
    }

    async fn get_members(&self, join_id: JoinId) -> Result<Vec<JoinMember>> {
        let state = self.state.lock().unwrap();
        let members = state
            .members
            .get(&join_id)
            .ok_or_else(|| MailroomError::NotFound(format!("join {join_id}")))?;
        let created_on = state
            .joins
            .get(&join_id)
            .map(|j| j.created_on)
            .unwrap_or_else(|| self.clock.now());
        Ok(members
            .iter()
            .map(|(work_item_id, state)| JoinMember {
                join_id,
                work_item_id: work_item_id.clone(),
                state: *state,
                created_on,
            })
            .collect())
    }
}

// ============================================================================
// Handler doubles
// ============================================================================

/// Records every invocation and succeeds.
pub struct RecordingHandler {
    topic: String,
    invocations: Mutex<Vec<WorkItem>>,
}

impl RecordingHandler {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<WorkItem> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
        self.invocations.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// Fails the first `failures` invocations, then succeeds.
pub struct FlakyHandler {
    topic: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(topic: impl Into<String>, failures: usize) -> Self {
        Self {
            topic: topic.into(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FlakyHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, _item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("transient failure on call {}", call + 1);
        }
        Ok(())
    }
}

/// Always fails; permanently when built with [`AlwaysFailHandler::permanent`].
pub struct AlwaysFailHandler {
    topic: String,
    permanent: bool,
    calls: AtomicUsize,
}

impl AlwaysFailHandler {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            permanent: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn permanent(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            permanent: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for AlwaysFailHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, _item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            Err(crate::error::Permanent::new(anyhow::anyhow!("poison payload")).into())
        } else {
            anyhow::bail!("handler always fails")
        }
    }
}

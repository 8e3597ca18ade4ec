//! The built-in fan-in trigger: the `join.wait` handler.
//!
//! A `join.wait` work item polls a join on the standard retry cadence. While
//! the join is unsettled the handler fails retryably, so the dispatcher
//! abandons the item with backoff and it comes around again. Once every
//! expected step has reported, the handler settles the join's status and
//! enqueues the follow-up work item, and the `join.wait` item is acked.
//!
//! Delivery is at-least-once: a crash between the follow-up enqueue and the
//! ack redelivers `join.wait`, so the follow-up may be enqueued twice and
//! its handler must be idempotent like any other.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Permanent;
use crate::handler::{Handler, HandlerContext};
use crate::item::{NewWorkItem, WorkItem};
use crate::join::{JoinId, JoinStatus, JoinStore};
use crate::store::WorkItemStore;

/// Reserved topic for fan-in wait items.
pub const JOIN_WAIT_TOPIC: &str = "join.wait";

/// Typed payload of a `join.wait` work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitRequest {
    pub join_id: JoinId,
    /// When true, any failed step settles the join as `Failed`.
    pub fail_if_any_step_failed: bool,
    pub on_complete_topic: String,
    pub on_complete_payload: String,
    pub on_fail_topic: String,
    pub on_fail_payload: String,
}

/// Handler registered for [`JOIN_WAIT_TOPIC`].
pub struct JoinWaitHandler {
    joins: Arc<dyn JoinStore>,
    store: Arc<dyn WorkItemStore>,
}

impl JoinWaitHandler {
    pub fn new(joins: Arc<dyn JoinStore>, store: Arc<dyn WorkItemStore>) -> Self {
        Self { joins, store }
    }
}

#[async_trait]
impl Handler for JoinWaitHandler {
    fn topic(&self) -> &str {
        JOIN_WAIT_TOPIC
    }

    async fn handle(&self, item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
        // The payload is a typed record; a payload that does not decode will
        // never decode, so it dead-letters instead of retrying.
        let request: JoinWaitRequest = serde_json::from_str(&item.payload).map_err(|e| {
            Permanent::new(anyhow::anyhow!("invalid join.wait payload: {e}"))
        })?;

        let join = self.joins.get_join(request.join_id).await?;

        if !join.is_settled() {
            anyhow::bail!(
                "join {} not yet settled: {} of {} steps reported",
                join.id,
                join.completed_steps + join.failed_steps,
                join.expected_steps
            );
        }

        let (status, topic, payload) = if request.fail_if_any_step_failed && join.failed_steps > 0 {
            (
                JoinStatus::Failed,
                request.on_fail_topic,
                request.on_fail_payload,
            )
        } else {
            (
                JoinStatus::Completed,
                request.on_complete_topic,
                request.on_complete_payload,
            )
        };

        self.joins.update_status(join.id, status).await?;

        let mut follow_up = NewWorkItem::new(topic.clone(), payload);
        if let Some(correlation_id) = &item.correlation_id {
            follow_up = follow_up.correlation_id(correlation_id.clone());
        }
        self.store.enqueue(follow_up).await?;

        info!(
            join_id = %join.id,
            status = %status,
            completed = join.completed_steps,
            failed = join.failed_steps,
            follow_up_topic = %topic,
            "join settled, follow-up enqueued"
        );
        Ok(())
    }
}

//! Handler-dispatch engine: claim → route → finalise.
//!
//! One [`Dispatcher::run_once`] iteration mints a fresh owner token, claims
//! a bounded batch, routes every claimed item to the handler registered for
//! its topic, and finalises the batch: successes are acked together,
//! failures are partitioned into permanent fails and delayed abandons.
//!
//! Items inside a batch run concurrently, but never two handlers for the
//! same item: each claimed id is dispatched exactly once per iteration, and
//! the lease keeps other workers away.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!     │
//!     ├─► Claim batch (owner token fences the lease)
//!     ├─► Get item + resolve handler by topic
//!     │       ├─ no handler   → dead-letter
//!     │       └─ handler runs → outcome per item (lease beaten underneath)
//!     └─► Finalise: Ack successes
//!                   Fail (attempts exhausted or Permanent)
//!                   Abandon grouped by (delay, error)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::{is_permanent, Result};
use crate::handler::{Handler, HandlerContext, HandlerRegistry};
use crate::item::{OwnerToken, WorkItem, WorkItemId};
use crate::provider::{StoreHandle, StoreProvider};
use crate::strategy::{PollCursor, SelectionStrategy};

/// Reason recorded when an item exhausts its retry budget.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "Maximum retry attempts exceeded";

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity stamped into `processed_by`.
    pub worker_id: String,
    /// Lease duration for claimed items.
    pub lease: Duration,
    /// Attempts after which Abandon becomes Fail.
    pub max_attempts: u32,
    /// Claim upper bound per iteration.
    pub batch_size: usize,
    /// How often to extend the lease while a handler is still running;
    /// `None` disables heartbeats. Keep it well under the lease so one
    /// missed beat does not lose the item to the reaper.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let lease = Duration::from_secs(30);
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease,
            max_attempts: 5,
            batch_size: 50,
            heartbeat_interval: Some(lease / 3),
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

enum Outcome {
    Success(WorkItemId),
    /// Retryable handler failure; `attempt_count` is the row's value at
    /// dispatch time.
    Retry {
        id: WorkItemId,
        attempt_count: i32,
        error: String,
    },
    /// Permanent failure, dead-lettered regardless of remaining attempts.
    Permanent {
        id: WorkItemId,
        reason: String,
    },
    /// The item vanished or the backend hiccuped between claim and get;
    /// leave it leased and let the reaper settle it.
    Skipped,
}

/// Turns claimed batches into handler invocations and terminal transitions.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            backoff: Arc::new(ExponentialBackoff::default()),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            backoff: Arc::new(ExponentialBackoff::default()),
            config,
        }
    }

    /// Replace the default backoff policy.
    pub fn backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = policy;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// One multi-store cycle: refresh the store set, let the strategy pick,
    /// run one iteration there, and advance the cursor.
    ///
    /// Returns the number of items processed, 0 when no store was selected.
    pub async fn run_cycle(
        &self,
        provider: &dyn StoreProvider,
        strategy: &dyn SelectionStrategy,
        cursor: &mut PollCursor,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let stores = provider.stores().await?;
        let Some(handle) = strategy.select(&stores, cursor) else {
            debug!("no stores available to poll");
            return Ok(0);
        };
        let handle = handle.clone();

        let processed = self.run_once(&handle, cancel).await?;
        cursor.record(handle.identifier(), processed);
        Ok(processed)
    }

    /// One iteration against one store. Returns the number of claimed items.
    pub async fn run_once(&self, handle: &StoreHandle, cancel: &CancellationToken) -> Result<usize> {
        let store = handle.store();
        let owner = OwnerToken::mint();

        let claimed = store
            .claim(&owner, self.config.lease, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(
            store = %handle.identifier(),
            count = claimed.len(),
            owner = %owner,
            "claimed batch"
        );

        let ctx = HandlerContext {
            worker_id: self.config.worker_id.clone(),
            store: handle.identifier().to_string(),
            cancel: cancel.clone(),
        };

        // Dispatch concurrently; a cancelled token stops further items from
        // starting, while started handlers run to their own cancellation
        // point. Undispatched items stay leased and come back via the
        // reaper.
        let outcomes = join_all(claimed.into_iter().map(|id| {
            let ctx = ctx.clone();
            let handle = handle.clone();
            async move {
                if ctx.cancel.is_cancelled() {
                    return Outcome::Skipped;
                }
                self.dispatch_one(&handle, &owner, id, &ctx).await
            }
        }))
        .await;

        self.finalise(handle, &owner, outcomes).await
    }

    async fn dispatch_one(
        &self,
        handle: &StoreHandle,
        owner: &OwnerToken,
        id: WorkItemId,
        ctx: &HandlerContext,
    ) -> Outcome {
        let item = match handle.store().get(&id).await {
            Ok(item) => item,
            Err(e) => {
                error!(store = %handle.identifier(), item_id = %id, error = %e, "failed to load claimed item");
                return Outcome::Skipped;
            }
        };

        let Some(handler) = self.registry.resolve(&item.topic) else {
            warn!(store = %handle.identifier(), item_id = %id, topic = %item.topic, "no handler registered");
            return Outcome::Permanent {
                id,
                reason: format!("No handler registered for topic '{}'", item.topic),
            };
        };

        match self
            .handle_with_heartbeat(handle, owner, &handler, &item, ctx)
            .await
        {
            Ok(()) => {
                debug!(store = %handle.identifier(), item_id = %id, topic = %item.topic, "item handled");
                Outcome::Success(id)
            }
            Err(e) if is_permanent(&e) => {
                warn!(store = %handle.identifier(), item_id = %id, topic = %item.topic, error = %e, "permanent handler failure");
                Outcome::Permanent {
                    id,
                    reason: format!("{e:#}"),
                }
            }
            Err(e) => {
                warn!(store = %handle.identifier(), item_id = %id, topic = %item.topic, error = %e, "handler failed");
                Outcome::Retry {
                    id,
                    attempt_count: item.attempt_count,
                    error: format!("{e:#}"),
                }
            }
        }
    }

    /// Run one handler, extending the item's lease underneath it until it
    /// finishes. A handler that outlives its lease would otherwise be
    /// redelivered mid-flight by the reaper.
    async fn handle_with_heartbeat(
        &self,
        handle: &StoreHandle,
        owner: &OwnerToken,
        handler: &Arc<dyn Handler>,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> anyhow::Result<()> {
        let Some(interval) = self.config.heartbeat_interval else {
            return handler.handle(item, ctx).await;
        };

        let stop = CancellationToken::new();
        let beat = {
            let stop = stop.clone();
            let store = handle.store().clone();
            let store_id = handle.identifier().to_string();
            let owner = *owner;
            let id = item.id.clone();
            let lease = self.config.lease;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the claim already set the first lease

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = store
                                .extend_lease(&owner, std::slice::from_ref(&id), lease)
                                .await
                            {
                                warn!(store = %store_id, item_id = %id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        let result = handler.handle(item, ctx).await;
        stop.cancel();
        let _ = beat.await;
        result
    }

    async fn finalise(
        &self,
        handle: &StoreHandle,
        owner: &OwnerToken,
        outcomes: Vec<Outcome>,
    ) -> Result<usize> {
        let store = handle.store();
        let processed = outcomes.len();

        let mut succeeded: Vec<WorkItemId> = Vec::new();
        // Grouped by reason so each distinct failure is one round-trip.
        let mut failed: HashMap<String, Vec<WorkItemId>> = HashMap::new();
        // Grouped by (delay, error) to minimise round-trips.
        let mut abandoned: HashMap<(Duration, String), Vec<WorkItemId>> = HashMap::new();

        for outcome in outcomes {
            match outcome {
                Outcome::Success(id) => succeeded.push(id),
                Outcome::Permanent { id, reason } => failed.entry(reason).or_default().push(id),
                Outcome::Retry {
                    id,
                    attempt_count,
                    error,
                } => {
                    let next_attempt = attempt_count + 1;
                    if next_attempt > self.config.max_attempts as i32 {
                        failed
                            .entry(MAX_ATTEMPTS_EXCEEDED.to_string())
                            .or_default()
                            .push(id);
                    } else {
                        let delay = self.backoff.delay(next_attempt as u32);
                        abandoned.entry((delay, error)).or_default().push(id);
                    }
                }
                Outcome::Skipped => {}
            }
        }

        if !succeeded.is_empty() {
            store
                .ack(owner, &self.config.worker_id, &succeeded)
                .await?;
        }
        for (reason, ids) in failed {
            warn!(store = %handle.identifier(), count = ids.len(), reason = %reason, "dead-lettering items");
            store
                .fail(owner, &self.config.worker_id, &ids, &reason)
                .await?;
        }
        for ((delay, error), ids) in abandoned {
            debug!(
                store = %handle.identifier(),
                count = ids.len(),
                delay_ms = delay.as_millis() as u64,
                "abandoning items for retry"
            );
            store
                .abandon(owner, &ids, Some(&error), Some(delay))
                .await?;
        }

        Ok(processed)
    }
}

//! The polling loop: drives the dispatcher at a cadence.
//!
//! The loop schedules on `tokio::time`, which is monotonic, so wall-clock
//! jumps (NTP) never dilate or compress the interval. Each iteration is
//! independently guarded: a transient backend error is logged and the loop
//! carries on — any items left `Processing` by a lost batch come back via
//! the reaper.
//!
//! Backpressure is the cadence itself: an empty claim sleeps the full
//! interval, a full batch fires again at the next tick. Operators size
//! `batch_size` and the interval to the database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::provider::StoreProvider;
use crate::service::{SchemaReady, Service};
use crate::strategy::{PollCursor, SelectionStrategy};

/// Polling loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Dispatcher loop cadence.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Long-running task that invokes the dispatcher at a cadence.
pub struct QueueWorker {
    provider: Arc<dyn StoreProvider>,
    strategy: Arc<dyn SelectionStrategy>,
    dispatcher: Dispatcher,
    config: WorkerConfig,
    gate: Option<Arc<dyn SchemaReady>>,
}

impl QueueWorker {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        strategy: Arc<dyn SelectionStrategy>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            provider,
            strategy,
            dispatcher,
            config: WorkerConfig::default(),
            gate: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Gate the first iteration on schema readiness.
    pub fn with_schema_gate(mut self, gate: Arc<dyn SchemaReady>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl Service for QueueWorker {
    fn name(&self) -> &'static str {
        "queue-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            worker_id = %self.dispatcher.config().worker_id,
            batch_size = self.dispatcher.config().batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "queue worker starting"
        );

        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                ready = gate.wait_ready() => {
                    if let Err(e) = ready {
                        // The loop's per-iteration guards absorb whatever a
                        // half-ready schema still throws.
                        warn!(error = %e, "schema readiness gate failed, continuing anyway");
                    }
                }
            }
        }

        let mut cursor = PollCursor::default();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self
                .dispatcher
                .run_cycle(
                    self.provider.as_ref(),
                    self.strategy.as_ref(),
                    &mut cursor,
                    &shutdown,
                )
                .await
            {
                Ok(0) => {}
                Ok(count) => debug!(count, "iteration processed items"),
                Err(e) => warn!(error = %e, "dispatch iteration failed"),
            }
        }

        info!(worker_id = %self.dispatcher.config().worker_id, "queue worker stopped");
        Ok(())
    }
}

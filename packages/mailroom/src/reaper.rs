//! Lease reaper: returns expired leases to the queue.
//!
//! If a handler or its host dies mid-flight, the item stays `Processing`
//! until `locked_until` passes; the reaper then flips it back to `Ready`
//! without touching `attempt_count` — lease expiry is an infrastructure
//! event, not a handler failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::provider::StoreProvider;
use crate::service::Service;

/// Reaper tuning.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Scan cadence; keep it at or below half the lease duration so an
    /// expired lease is never held hostage for a full extra lease.
    pub interval: Duration,
}

impl ReaperConfig {
    /// Derive the cadence from the lease duration: `lease / 2`, floored at
    /// one second.
    pub fn for_lease(lease: Duration) -> Self {
        Self {
            interval: (lease / 2).max(Duration::from_secs(1)),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self::for_lease(Duration::from_secs(30))
    }
}

/// Periodic scan that releases leases whose deadline has passed, across
/// every store the provider knows.
pub struct LeaseReaper {
    provider: Arc<dyn StoreProvider>,
    config: ReaperConfig,
}

impl LeaseReaper {
    pub fn new(provider: Arc<dyn StoreProvider>, config: ReaperConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl Service for LeaseReaper {
    fn name(&self) -> &'static str {
        "lease-reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "lease reaper starting"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let stores = match self.provider.stores().await {
                Ok(stores) => stores,
                Err(e) => {
                    warn!(error = %e, "reaper failed to list stores");
                    continue;
                }
            };

            for handle in stores {
                if shutdown.is_cancelled() {
                    break;
                }
                match handle.store().reap_expired().await {
                    Ok(0) => {}
                    Ok(count) => {
                        info!(store = %handle.identifier(), count, "released expired leases")
                    }
                    Err(e) => {
                        warn!(store = %handle.identifier(), error = %e, "lease reap failed")
                    }
                }
            }
        }

        info!("lease reaper stopped");
        Ok(())
    }
}

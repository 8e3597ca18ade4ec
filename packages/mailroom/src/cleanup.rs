//! Terminal-row cleanup: prunes Done and Dead rows past retention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::provider::StoreProvider;
use crate::service::Service;

/// Cleanup tuning.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How long terminal rows are kept after processing.
    pub retention: Duration,
    /// Scan cadence.
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Periodic scan that deletes terminal rows older than the retention window,
/// across every store the provider knows.
pub struct TerminalCleanup {
    provider: Arc<dyn StoreProvider>,
    config: CleanupConfig,
}

impl TerminalCleanup {
    pub fn new(provider: Arc<dyn StoreProvider>, config: CleanupConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl Service for TerminalCleanup {
    fn name(&self) -> &'static str {
        "terminal-cleanup"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "terminal cleanup starting"
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
                    warn!(error = %e, "cleanup failed to list stores");
                    continue;
                }
            };

            for handle in stores {
                if shutdown.is_cancelled() {
                    break;
                }
                match handle.store().cleanup(self.config.retention).await {
                    Ok(0) => {}
                    Ok(count) => {
                        info!(store = %handle.identifier(), count, "deleted terminal rows")
                    }
                    Err(e) => {
                        warn!(store = %handle.identifier(), error = %e, "cleanup failed")
                    }
                }
            }
        }

        info!("terminal cleanup stopped");
        Ok(())
    }
}

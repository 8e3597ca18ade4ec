//! Long-running service plumbing.
//!
//! Every background loop in the crate (polling worker, lease reaper,
//! terminal cleanup) implements [`Service`]; [`ServiceHost`] spawns them and
//! fans a shutdown signal out to all of them.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background task driven by a cancellation signal.
///
/// Implementations loop until `shutdown` is cancelled, finish their in-flight
/// iteration, and return.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Startup gate: blocks the polling loop until the backing schema is usable.
///
/// Deployments that roll schema out-of-band provide an implementation; a
/// gate failure is logged and ignored, the loop starts anyway and lets the
/// per-iteration guards absorb any residual errors.
#[async_trait]
pub trait SchemaReady: Send + Sync {
    async fn wait_ready(&self) -> anyhow::Result<()>;
}

/// Spawns services and waits for them to finish after shutdown.
///
/// # Example
///
/// ```ignore
/// ServiceHost::new()
///     .with_service(QueueWorker::new(provider.clone(), strategy, dispatcher))
///     .with_service(LeaseReaper::new(provider.clone(), reaper_config))
///     .with_service(TerminalCleanup::new(provider, cleanup_config))
///     .run_until_shutdown()
///     .await;
/// ```
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Run every service until `shutdown` fires, then wait for them to stop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "starting service");
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                } else {
                    info!(service = name, "service stopped");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Run until Ctrl+C, then propagate shutdown and wait.
    pub async fn run_until_shutdown(self) {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            signal.cancel();
        });
        self.run(shutdown).await;
    }
}

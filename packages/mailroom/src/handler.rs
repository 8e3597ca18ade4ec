//! Handler contract and topic registry.
//!
//! A handler owns one topic. The dispatcher resolves handlers by
//! case-insensitive topic match and invokes them with at-least-once
//! semantics, so every handler MUST be idempotent: after a crash between
//! handler success and ack, the item is redelivered.
//!
//! Returning an error signals retryable failure; wrap the cause in
//! [`crate::error::Permanent`] to dead-letter immediately instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{MailroomError, Result};
use crate::item::WorkItem;

/// Per-invocation context handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    /// Identity of the dispatching worker; lands in `processed_by`.
    pub worker_id: String,
    /// Stable identifier of the store the item came from.
    pub store: String,
    /// Cooperative cancellation; long-running handlers should poll this to
    /// bound their own work, since the core enforces no per-handler timeout.
    pub cancel: CancellationToken,
}

/// Processes work items for a single topic.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The topic this handler consumes. Matching is case-insensitive.
    fn topic(&self) -> &str;

    /// Process one item. An `Err` routes the item to the retry path.
    async fn handle(&self, item: &WorkItem, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Immutable topic → handler map, built once at startup.
///
/// # Example
///
/// ```ignore
/// let registry = HandlerRegistry::from_handlers([
///     Arc::new(SendEmailHandler::new(mailer)) as Arc<dyn Handler>,
///     Arc::new(JoinWaitHandler::new(joins, store)),
/// ])?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    // Keyed by lowercased topic.
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a handler collection.
    ///
    /// Duplicate topics are a configuration error: two handlers competing
    /// for one topic means the wiring is wrong, and it is caught here, at
    /// construction, not at dispatch time.
    pub fn from_handlers<I>(handlers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Handler>>,
    {
        let mut registry = Self::new();
        for handler in handlers {
            registry.register(handler)?;
        }
        Ok(registry)
    }

    /// Add one handler. Errors on duplicate topic.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let key = handler.topic().to_ascii_lowercase();
        if key.is_empty() {
            return Err(MailroomError::Configuration(
                "handler topic must not be empty".into(),
            ));
        }
        if self.handlers.contains_key(&key) {
            return Err(MailroomError::Configuration(format!(
                "duplicate handler for topic '{key}'"
            )));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Look up the handler for a topic, case-insensitively.
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&topic.to_ascii_lowercase()).cloned()
    }

    /// Registered topics, lowercased.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

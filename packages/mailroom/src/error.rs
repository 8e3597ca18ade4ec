//! Structured error types for the work-queue core.
//!
//! `MailroomError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `anyhow` remains the internal transport (ergonomic for
//! handlers and backend plumbing); it crosses into callers only wrapped in
//! the `Backend` variant.
//!
//! Ownership mismatches are deliberately absent from this taxonomy: a stale
//! worker racing the reaper is an expected interleaving, and the store
//! resolves it with a silent no-op rather than an error.

use thiserror::Error;

/// Errors surfaced by stores, providers, and the dispatcher.
#[derive(Debug, Error)]
pub enum MailroomError {
    /// Invalid caller input (empty topic, oversized field, bad name format).
    /// Never retried by the core.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested work item or join does not exist. Surfaced to direct
    /// callers; batch operations absorb unknown ids as no-ops.
    #[error("not found: {0}")]
    NotFound(String),

    /// Detected at construction time (duplicate topic handler, missing
    /// connection, malformed schema/table name). Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Database connectivity, deadlock, serialization failure, and other
    /// backend trouble. The polling loops catch these, log, and continue.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MailroomError>;

/// Marker for handler failures that must not be retried.
///
/// A handler error is retryable by default. Wrapping the cause in
/// `Permanent` routes the item straight to `Dead` instead of the
/// abandon/backoff path. Non-idempotent redelivery is *not* a permanent
/// signal on its own; reserve this for errors that cannot succeed on any
/// future attempt (malformed payload, unsupported version).
///
/// # Example
///
/// ```ignore
/// async fn handle(&self, item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
///     let req: Request = serde_json::from_str(&item.payload)
///         .map_err(|e| Permanent::new(anyhow::anyhow!("invalid payload: {e}")))?;
///     // ...
/// }
/// ```
#[derive(Debug, Error)]
#[error("{source}")]
pub struct Permanent {
    #[source]
    source: anyhow::Error,
}

impl Permanent {
    /// Wrap an error so the dispatcher treats it as non-retryable.
    pub fn new(source: anyhow::Error) -> Self {
        Self { source }
    }

    /// Consume the marker and return the underlying cause.
    pub fn into_inner(self) -> anyhow::Error {
        self.source
    }
}

/// True when `error` or any of its causes carries the [`Permanent`] marker.
pub fn is_permanent(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Permanent>())
}

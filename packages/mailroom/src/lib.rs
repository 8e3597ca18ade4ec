//! Durable work-queue core.
//!
//! mailroom implements the transactional-outbox pattern on a relational
//! backend with at-least-once delivery: a work-item state machine with
//! atomic claim-with-lease semantics, acknowledgement / abandon / fail /
//! revive transitions fenced by owner tokens, exponential backoff with
//! jitter, expired-lease reaping, terminal-row cleanup, pluggable
//! multi-tenant store routing, and fan-in joins that trigger follow-up work
//! when a group of related items completes.
//!
//! Two symmetric subsystems ride on the same core: an *inbox* (dedup and
//! processing of inbound events, ids supplied by the caller as dedup keys)
//! and an *outbox* (transactional enqueue and reliable dispatch, ids
//! generated). The difference is configuration — table name and who mints
//! the id — not code.
//!
//! # Overview
//!
//! ```text
//! QueueWorker (interval, monotonic)
//!     │
//!     ├─► StoreProvider.stores()          configured / discovery-backed
//!     ├─► SelectionStrategy.select()      round-robin / drain-first
//!     └─► Dispatcher.run_once(store)
//!             ├─► claim(owner, lease, batch)
//!             ├─► handler per topic (case-insensitive)
//!             └─► ack / abandon(backoff) / fail
//!
//! LeaseReaper     every lease/2: expired Processing → Ready
//! TerminalCleanup every hour:    old Done/Dead rows deleted
//! ```
//!
//! # Guarantees
//!
//! - **At-least-once delivery**: handlers must be idempotent; a crash
//!   between handler success and ack redelivers.
//! - **Lease exclusivity**: concurrent claims never hand the same row to two
//!   owners; the owner token fences every finalising transition.
//! - **No ordering**: claims follow `created_on` within one iteration, but
//!   concurrent workers interleave freely.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailroom::{
//!     ConfiguredProvider, Dispatcher, DispatcherConfig, HandlerRegistry,
//!     QueueWorker, RoundRobin, ServiceHost,
//! };
//!
//! let registry = Arc::new(HandlerRegistry::from_handlers([
//!     Arc::new(SendEmailHandler::new(mailer)) as Arc<_>,
//! ])?);
//! let provider = Arc::new(ConfiguredProvider::single("primary", store));
//! let dispatcher = Dispatcher::with_config(registry, DispatcherConfig::default());
//!
//! ServiceHost::new()
//!     .with_service(QueueWorker::new(provider, Arc::new(RoundRobin), dispatcher))
//!     .run_until_shutdown()
//!     .await;
//! ```

pub mod backoff;
pub mod cleanup;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod item;
pub mod join;
pub mod join_wait;
pub mod provider;
pub mod reaper;
pub mod service;
pub mod store;
pub mod strategy;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff, NoBackoff};
pub use cleanup::{CleanupConfig, TerminalCleanup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{Dispatcher, DispatcherConfig, MAX_ATTEMPTS_EXCEEDED};
pub use error::{is_permanent, MailroomError, Permanent, Result};
pub use handler::{Handler, HandlerContext, HandlerRegistry};
pub use item::{
    EnqueueResult, NewWorkItem, OwnerToken, WorkItem, WorkItemId, WorkItemStatus, MAX_TOPIC_LEN,
};
pub use join::{Join, JoinId, JoinMember, JoinStatus, JoinStore, MemberState};
pub use join_wait::{JoinWaitHandler, JoinWaitRequest, JOIN_WAIT_TOPIC};
pub use provider::{
    ConfiguredProvider, ConnectionIdentity, ControlPlaneFilter, Discovery, DynamicProvider,
    PlatformProvider, StoreConfig, StoreFactory, StoreHandle, StoreProvider,
};
pub use reaper::{LeaseReaper, ReaperConfig};
pub use service::{SchemaReady, Service, ServiceHost};
pub use store::WorkItemStore;
pub use strategy::{DrainFirst, PollCursor, RoundRobin, SelectionStrategy};
pub use worker::{QueueWorker, WorkerConfig};

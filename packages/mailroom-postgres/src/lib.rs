//! PostgreSQL backend for the mailroom work-queue core.
//!
//! Implements the [`mailroom::WorkItemStore`] and [`mailroom::JoinStore`]
//! contracts over `sqlx::PgPool`:
//!
//! - Claiming uses `FOR UPDATE SKIP LOCKED`, so concurrent workers neither
//!   block nor double-claim.
//! - Ack and Fail chain data-modifying CTEs: the work-item transition and
//!   the join-counter increments commit in one statement.
//! - Table names are validated identifiers rendered into the SQL once per
//!   store; a schema/table pair is one queue, so an inbox and an outbox are
//!   just two stores over the same pool.
//!
//! # Example
//!
//! ```ignore
//! use mailroom_postgres::{PgStoreSettings, PgWorkItemStore};
//!
//! let settings = PgStoreSettings::new(std::env::var("DATABASE_URL")?)
//!     .schema("queue")
//!     .table("outbox")
//!     .deploy_schema(true);
//! let store = PgWorkItemStore::connect(settings).await?;
//!
//! // Transactional enqueue alongside a business write:
//! let mut tx = store.pool().begin().await?;
//! sqlx::query("INSERT INTO orders ...").execute(&mut *tx).await?;
//! store
//!     .enqueue_with(&mut *tx, NewWorkItem::new("order.created", payload))
//!     .await?;
//! tx.commit().await?;
//! ```

mod factory;
mod gate;
mod join;
mod schema;
mod settings;
mod store;

pub use factory::PgStoreFactory;
pub use gate::PgSchemaGate;
pub use join::PgJoinStore;
pub use schema::{ddl_statements, deploy};
pub use settings::PgStoreSettings;
pub use store::{PgWorkItemStore, QueueStats};

/// Lift a database error into the core taxonomy.
pub(crate) fn db_err(e: impl Into<anyhow::Error>) -> mailroom::MailroomError {
    mailroom::MailroomError::Backend(e.into())
}

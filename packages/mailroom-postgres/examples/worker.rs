//! A complete worker process: one Postgres store, a couple of handlers, and
//! the three background services.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/mailroom cargo run -p mailroom-postgres --example worker
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use mailroom::{
    ConfiguredProvider, Dispatcher, DispatcherConfig, Handler, HandlerContext, HandlerRegistry,
    JoinStore, JoinWaitHandler, LeaseReaper, NewWorkItem, QueueWorker, ReaperConfig, RoundRobin,
    ServiceHost, TerminalCleanup, WorkItem, WorkItemStore,
};
use mailroom_postgres::{PgJoinStore, PgStoreSettings, PgWorkItemStore};
use tracing::info;

struct EmailHandler;

#[async_trait]
impl Handler for EmailHandler {
    fn topic(&self) -> &str {
        "email.send"
    }

    async fn handle(&self, item: &WorkItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
        info!(item_id = %item.id, payload = %item.payload, "pretending to send an email");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailroom=debug".into()),
        )
        .init();

    let settings = PgStoreSettings::new(std::env::var("DATABASE_URL")?)
        .schema("mailroom")
        .table("outbox")
        .deploy_schema(true);
    let store = Arc::new(PgWorkItemStore::connect(settings.clone()).await?);
    let joins = Arc::new(PgJoinStore::new(store.pool().clone(), settings)?);

    let registry = Arc::new(HandlerRegistry::from_handlers([
        Arc::new(EmailHandler) as Arc<dyn Handler>,
        Arc::new(JoinWaitHandler::new(
            joins.clone() as Arc<dyn JoinStore>,
            store.clone() as Arc<dyn WorkItemStore>,
        )),
    ])?);

    // Seed some work so the loop has something to chew on.
    store
        .enqueue(NewWorkItem::new("email.send", r#"{"to":"ops@example.com"}"#))
        .await?;

    let provider = Arc::new(ConfiguredProvider::single(
        "primary",
        store.clone() as Arc<dyn WorkItemStore>,
    ));
    let config = DispatcherConfig::default();
    let reaper_config = ReaperConfig::for_lease(config.lease);
    let dispatcher = Dispatcher::with_config(registry, config);

    ServiceHost::new()
        .with_service(QueueWorker::new(
            provider.clone(),
            Arc::new(RoundRobin),
            dispatcher,
        ))
        .with_service(LeaseReaper::new(provider.clone(), reaper_config))
        .with_service(TerminalCleanup::new(provider, Default::default()))
        .run_until_shutdown()
        .await;

    Ok(())
}

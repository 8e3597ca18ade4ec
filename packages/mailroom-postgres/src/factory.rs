//! Store factory for discovery-backed providers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use mailroom::{Result, StoreConfig, StoreFactory, WorkItemStore};

use crate::settings::PgStoreSettings;
use crate::store::PgWorkItemStore;

/// Builds [`PgWorkItemStore`]s from discovered [`StoreConfig`]s.
///
/// The dynamic provider calls this for every newly discovered or rebuilt
/// entry; the factory owns the per-store policy (pool sizing, schema
/// deployment) that discovery does not carry.
pub struct PgStoreFactory {
    enable_schema_deployment: bool,
    max_connections: u32,
}

impl Default for PgStoreFactory {
    fn default() -> Self {
        Self {
            enable_schema_deployment: false,
            max_connections: 5,
        }
    }
}

impl PgStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy_schema(mut self, enable: bool) -> Self {
        self.enable_schema_deployment = enable;
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

#[async_trait]
impl StoreFactory for PgStoreFactory {
    async fn build(&self, config: &StoreConfig) -> Result<Arc<dyn WorkItemStore>> {
        let settings = PgStoreSettings::new(config.connection.clone())
            .schema(config.schema.clone())
            .table(config.table.clone())
            .deploy_schema(self.enable_schema_deployment)
            .max_connections(self.max_connections);

        let store = PgWorkItemStore::connect(settings).await?;
        info!(
            store = %config.identifier,
            schema = %config.schema,
            table = %config.table,
            "connected queue store"
        );
        Ok(Arc::new(store))
    }
}

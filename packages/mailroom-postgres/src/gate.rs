//! Schema readiness gate.
//!
//! Deployments where DDL rolls out-of-band hand this gate to the polling
//! loop: it polls `to_regclass` until the work-item table exists, then lets
//! the first iteration through. Bounded by `max_wait`; on timeout the gate
//! errors, which the loop logs and ignores.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;
use tracing::debug;

use mailroom::SchemaReady;

use crate::settings::PgStoreSettings;

/// Waits for the queue table to appear in the catalog.
pub struct PgSchemaGate {
    pool: PgPool,
    qualified_table: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl PgSchemaGate {
    pub fn new(pool: PgPool, settings: &PgStoreSettings) -> Self {
        Self {
            pool,
            qualified_table: format!("{}.{}", settings.schema, settings.table),
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(60),
        }
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    async fn table_exists(&self) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(&self.qualified_table)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }
}

#[async_trait]
impl SchemaReady for PgSchemaGate {
    async fn wait_ready(&self) -> anyhow::Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            if self.table_exists().await? {
                debug!(table = %self.qualified_table, "schema ready");
                return Ok(());
            }
            if start.elapsed() >= self.max_wait {
                anyhow::bail!(
                    "table {} did not appear within {:?}",
                    self.qualified_table,
                    self.max_wait
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

//! Canonical schema DDL.
//!
//! Deployment is idempotent (`IF NOT EXISTS` throughout) and runs statement
//! by statement on first contact when `enable_schema_deployment` is set.
//!
//! Index set, sized to the hot paths:
//! - `(status, created_on)` covers the claim scan
//! - partial `(due_on)` narrows the due filter
//! - partial `(locked_until)` serves the reaper
//! - `(work_item_id)` on the member table serves the ack/fail join lookup

use sqlx::PgPool;
use tracing::info;

use crate::settings::PgStoreSettings;

/// Render the DDL statements for one store's tables.
pub fn ddl_statements(settings: &PgStoreSettings) -> Vec<String> {
    let work = settings.work_table();
    let join = settings.join_table();
    let member = settings.member_table();
    let schema = &settings.schema;
    let table = &settings.table;

    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {work} (
                id            TEXT PRIMARY KEY,
                topic         TEXT NOT NULL,
                payload       TEXT NOT NULL,
                correlation_id TEXT,
                source        TEXT,
                hash          TEXT,
                status        TEXT NOT NULL DEFAULT 'ready',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                owner_token   UUID,
                locked_until  TIMESTAMPTZ,
                due_on        TIMESTAMPTZ,
                created_on    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                processed_on  TIMESTAMPTZ,
                processed_by  TEXT,
                last_error    TEXT
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_claim_idx\" ON {work} (status, created_on)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_due_idx\" ON {work} (due_on) WHERE due_on IS NOT NULL"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_lease_idx\" ON {work} (locked_until) WHERE locked_until IS NOT NULL"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_correlation_idx\" ON {work} (correlation_id) WHERE correlation_id IS NOT NULL"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {join} (
                id              UUID PRIMARY KEY,
                tenant_id       TEXT NOT NULL,
                expected_steps  INTEGER NOT NULL CHECK (expected_steps >= 1),
                completed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps    INTEGER NOT NULL DEFAULT 0,
                status          TEXT NOT NULL DEFAULT 'pending',
                metadata        TEXT,
                created_on      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_updated_on TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {member} (
                join_id      UUID NOT NULL REFERENCES {join} (id) ON DELETE CASCADE,
                work_item_id TEXT NOT NULL,
                state        TEXT NOT NULL DEFAULT 'pending',
                created_on   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (join_id, work_item_id)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_join_member_item_idx\" ON {member} (work_item_id)"
        ),
    ]
}

/// Execute the DDL for one store.
pub async fn deploy(pool: &PgPool, settings: &PgStoreSettings) -> mailroom::Result<()> {
    for statement in ddl_statements(settings) {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .map_err(crate::db_err)?;
    }
    info!(
        schema = %settings.schema,
        table = %settings.table,
        "queue schema deployed"
    );
    Ok(())
}

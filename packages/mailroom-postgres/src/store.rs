//! PostgreSQL work-item store.
//!
//! Every state transition is one parameterized statement — claim uses a
//! `FOR UPDATE SKIP LOCKED` CTE, and ack/fail chain data-modifying CTEs so
//! the work-item transition and the join-counter increments commit together.
//! One statement means one round-trip and one implicit transaction; there is
//! no read-then-write window for a concurrent worker to slip into.
//!
//! The SQL is rendered once per store at construction: table names are
//! validated identifiers baked into the text, everything else is a bind
//! parameter.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use mailroom::{
    EnqueueResult, MailroomError, NewWorkItem, OwnerToken, Result, WorkItem, WorkItemId,
    WorkItemStore,
};

use crate::db_err;
use crate::schema;
use crate::settings::PgStoreSettings;

const ITEM_COLUMNS: &str = "id, topic, payload, correlation_id, source, hash, status, \
     attempt_count, owner_token, locked_until, due_on, created_on, processed_on, \
     processed_by, last_error";

/// Pre-rendered statements for one store's tables.
struct StoreSql {
    insert: String,
    claim: String,
    ack: String,
    abandon: String,
    fail: String,
    extend_lease: String,
    revive: String,
    reap: String,
    get: String,
    cleanup: String,
    stats: String,
}

impl StoreSql {
    fn render(settings: &PgStoreSettings) -> Self {
        let work = settings.work_table();
        let join = settings.join_table();
        let member = settings.member_table();

        Self {
            insert: format!(
                r#"
                INSERT INTO {work}
                    (id, topic, payload, correlation_id, source, hash, status, attempt_count, due_on)
                VALUES ($1, $2, $3, $4, $5, $6, 'ready', 0, $7)
                ON CONFLICT (id) DO NOTHING
                "#
            ),
            claim: format!(
                r#"
                WITH eligible AS (
                    SELECT id
                    FROM {work}
                    WHERE (status = 'ready'
                           OR (status = 'processing' AND locked_until <= NOW()))
                      AND (due_on IS NULL OR due_on <= NOW())
                    ORDER BY created_on
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {work} AS w
                SET status = 'processing',
                    owner_token = $2,
                    locked_until = NOW() + make_interval(secs => $3)
                FROM eligible
                WHERE w.id = eligible.id
                RETURNING w.id
                "#
            ),
            ack: format!(
                r#"
                WITH acked AS (
                    UPDATE {work}
                    SET status = 'done',
                        processed_on = NOW(),
                        processed_by = $3,
                        owner_token = NULL,
                        locked_until = NULL
                    WHERE id = ANY($1)
                      AND owner_token = $2
                      AND status = 'processing'
                    RETURNING id
                ),
                flipped AS (
                    UPDATE {member} AS m
                    SET state = 'completed'
                    FROM acked
                    WHERE m.work_item_id = acked.id
                      AND m.state = 'pending'
                    RETURNING m.join_id
                ),
                bumped AS (
                    UPDATE {join} AS j
                    SET completed_steps = LEAST(j.completed_steps + f.n,
                                                j.expected_steps - j.failed_steps),
                        last_updated_on = NOW()
                    FROM (SELECT join_id, COUNT(*)::INT AS n
                          FROM flipped GROUP BY join_id) AS f
                    WHERE j.id = f.join_id
                    RETURNING j.id
                )
                SELECT COUNT(*) AS acked FROM acked
                "#
            ),
            abandon: format!(
                r#"
                UPDATE {work}
                SET status = 'ready',
                    attempt_count = attempt_count + 1,
                    last_error = COALESCE($3, last_error),
                    due_on = CASE WHEN $4::DOUBLE PRECISION IS NULL THEN NULL
                                  ELSE NOW() + make_interval(secs => $4) END,
                    owner_token = NULL,
                    locked_until = NULL
                WHERE id = ANY($1)
                  AND owner_token = $2
                  AND status = 'processing'
                "#
            ),
            fail: format!(
                r#"
                WITH failed AS (
                    UPDATE {work}
                    SET status = 'dead',
                        last_error = $4,
                        processed_on = NOW(),
                        processed_by = $3 || ':FAILED',
                        owner_token = NULL,
                        locked_until = NULL
                    WHERE id = ANY($1)
                      AND owner_token = $2
                      AND status = 'processing'
                    RETURNING id
                ),
                flipped AS (
                    UPDATE {member} AS m
                    SET state = 'failed'
                    FROM failed
                    WHERE m.work_item_id = failed.id
                      AND m.state = 'pending'
                    RETURNING m.join_id
                ),
                bumped AS (
                    UPDATE {join} AS j
                    SET failed_steps = LEAST(j.failed_steps + f.n,
                                             j.expected_steps - j.completed_steps),
                        last_updated_on = NOW()
                    FROM (SELECT join_id, COUNT(*)::INT AS n
                          FROM flipped GROUP BY join_id) AS f
                    WHERE j.id = f.join_id
                    RETURNING j.id
                )
                SELECT COUNT(*) AS failed FROM failed
                "#
            ),
            extend_lease: format!(
                r#"
                UPDATE {work}
                SET locked_until = NOW() + make_interval(secs => $3)
                WHERE id = ANY($1)
                  AND owner_token = $2
                  AND status = 'processing'
                "#
            ),
            revive: format!(
                r#"
                UPDATE {work}
                SET status = 'ready',
                    owner_token = NULL,
                    locked_until = NULL,
                    last_error = COALESCE($2, last_error),
                    due_on = CASE WHEN $3::DOUBLE PRECISION IS NULL THEN NULL
                                  ELSE NOW() + make_interval(secs => $3) END
                WHERE id = ANY($1)
                  AND status = 'dead'
                "#
            ),
            reap: format!(
                r#"
                UPDATE {work}
                SET status = 'ready',
                    owner_token = NULL,
                    locked_until = NULL
                WHERE status = 'processing'
                  AND locked_until IS NOT NULL
                  AND locked_until <= NOW()
                "#
            ),
            get: format!("SELECT {ITEM_COLUMNS} FROM {work} WHERE id = $1"),
            cleanup: format!(
                r#"
                DELETE FROM {work}
                WHERE status IN ('done', 'dead')
                  AND processed_on IS NOT NULL
                  AND processed_on < NOW() - make_interval(secs => $1)
                "#
            ),
            stats: format!(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'ready'
                                       AND (due_on IS NULL OR due_on <= NOW())) AS ready,
                    COUNT(*) FILTER (WHERE status = 'ready'
                                       AND due_on IS NOT NULL AND due_on > NOW()) AS scheduled,
                    COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                    COUNT(*) FILTER (WHERE status = 'done') AS done,
                    COUNT(*) FILTER (WHERE status = 'dead') AS dead
                FROM {work}
                "#
            ),
        }
    }
}

/// Point-in-time row counts for operator dashboards.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Claimable right now.
    pub ready: i64,
    /// Ready but due in the future.
    pub scheduled: i64,
    pub processing: i64,
    pub done: i64,
    pub dead: i64,
}

/// One Postgres-backed queue table (plus its join tables).
pub struct PgWorkItemStore {
    pool: PgPool,
    settings: PgStoreSettings,
    sql: StoreSql,
}

impl PgWorkItemStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, settings: PgStoreSettings) -> Result<Self> {
        settings.validate()?;
        let sql = StoreSql::render(&settings);
        Ok(Self {
            pool,
            settings,
            sql,
        })
    }

    /// Connect a fresh pool, deploying the schema first when configured.
    pub async fn connect(settings: PgStoreSettings) -> Result<Self> {
        settings.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await
            .map_err(db_err)?;
        if settings.enable_schema_deployment {
            schema::deploy(&pool, &settings).await?;
        }
        Self::new(pool, settings)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &PgStoreSettings {
        &self.settings
    }

    /// Transactional enqueue: insert on a caller-supplied connection, which
    /// is usually inside the caller's open transaction alongside its
    /// business write. The store neither commits nor rolls back.
    pub async fn enqueue_with(
        &self,
        conn: &mut PgConnection,
        item: NewWorkItem,
    ) -> Result<EnqueueResult> {
        item.validate()?;
        let id = item.id.clone().unwrap_or_else(WorkItemId::random);
        let inserted = sqlx::query(&self.sql.insert)
            .bind(id.as_str())
            .bind(&item.topic)
            .bind(&item.payload)
            .bind(item.correlation_id.as_deref())
            .bind(item.source.as_deref())
            .bind(item.hash.as_deref())
            .bind(item.due_on)
            .execute(conn)
            .await
            .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            Ok(EnqueueResult::Duplicate(id))
        } else {
            Ok(EnqueueResult::Created(id))
        }
    }

    /// Point-in-time queue health counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(&self.sql.stats)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(QueueStats {
            ready: row.try_get("ready").map_err(db_err)?,
            scheduled: row.try_get("scheduled").map_err(db_err)?,
            processing: row.try_get("processing").map_err(db_err)?,
            done: row.try_get("done").map_err(db_err)?,
            dead: row.try_get("dead").map_err(db_err)?,
        })
    }
}

fn map_item(row: &PgRow) -> Result<WorkItem> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(WorkItem {
        id: WorkItemId::new(id),
        topic: row.try_get("topic").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        correlation_id: row.try_get("correlation_id").map_err(db_err)?,
        source: row.try_get("source").map_err(db_err)?,
        hash: row.try_get("hash").map_err(db_err)?,
        status: status.parse()?,
        attempt_count: row.try_get("attempt_count").map_err(db_err)?,
        owner_token: row.try_get::<Option<Uuid>, _>("owner_token").map_err(db_err)?,
        locked_until: row.try_get("locked_until").map_err(db_err)?,
        due_on: row.try_get("due_on").map_err(db_err)?,
        created_on: row.try_get("created_on").map_err(db_err)?,
        processed_on: row.try_get("processed_on").map_err(db_err)?,
        processed_by: row.try_get("processed_by").map_err(db_err)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
    })
}

fn id_array(ids: &[WorkItemId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

#[async_trait]
impl WorkItemStore for PgWorkItemStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.enqueue_with(&mut conn, item).await
    }

    async fn claim(
        &self,
        owner: &OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<WorkItemId>> {
        let rows = sqlx::query(&self.sql.claim)
            .bind(batch_size as i64)
            .bind(owner.as_uuid())
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(db_err)?;
            ids.push(WorkItemId::new(id));
        }
        debug!(table = %self.settings.table, count = ids.len(), "claimed work items");
        Ok(ids)
    }

    async fn ack(&self, owner: &OwnerToken, worker_id: &str, ids: &[WorkItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&self.sql.ack)
            .bind(id_array(ids))
            .bind(owner.as_uuid())
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn abandon(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&self.sql.abandon)
            .bind(id_array(ids))
            .bind(owner.as_uuid())
            .bind(last_error)
            .bind(delay.map(|d| d.as_secs_f64()))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fail(
        &self,
        owner: &OwnerToken,
        worker_id: &str,
        ids: &[WorkItemId],
        reason: &str,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&self.sql.fail)
            .bind(id_array(ids))
            .bind(owner.as_uuid())
            .bind(worker_id)
            .bind(reason)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        owner: &OwnerToken,
        ids: &[WorkItemId],
        lease: Duration,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&self.sql.extend_lease)
            .bind(id_array(ids))
            .bind(owner.as_uuid())
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn revive(
        &self,
        ids: &[WorkItemId],
        reason: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&self.sql.revive)
            .bind(id_array(ids))
            .bind(reason)
            .bind(delay.map(|d| d.as_secs_f64()))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let result = sqlx::query(&self.sql.reap)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: &WorkItemId) -> Result<WorkItem> {
        let row = sqlx::query(&self.sql.get)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| MailroomError::NotFound(format!("work item {id}")))?;
        map_item(&row)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(&self.sql.cleanup)
            .bind(retention.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

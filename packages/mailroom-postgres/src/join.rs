//! PostgreSQL join store.
//!
//! The standalone counting path for handlers that establish membership after
//! the work item was already acked. The automatic path lives inside the
//! work-item store's ack/fail statements; both flip the member row first,
//! which is what keeps the two paths from double-counting.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use mailroom::{
    Join, JoinId, JoinMember, JoinStatus, JoinStore, MailroomError, Result, WorkItemId,
};

use crate::db_err;
use crate::settings::PgStoreSettings;

struct JoinSql {
    create: String,
    attach: String,
    increment_completed: String,
    increment_failed: String,
    update_status: String,
    get_join: String,
    get_members: String,
}

impl JoinSql {
    fn render(settings: &PgStoreSettings) -> Self {
        let join = settings.join_table();
        let member = settings.member_table();

        let increment = |state: &str, counter: &str, other: &str| {
            format!(
                r#"
                WITH flipped AS (
                    UPDATE {member}
                    SET state = '{state}'
                    WHERE join_id = $1
                      AND work_item_id = $2
                      AND state = 'pending'
                    RETURNING join_id
                ),
                bumped AS (
                    UPDATE {join} AS j
                    SET {counter} = LEAST(j.{counter} + 1, j.expected_steps - j.{other}),
                        last_updated_on = NOW()
                    FROM flipped
                    WHERE j.id = flipped.join_id
                    RETURNING j.id
                )
                SELECT COUNT(*) AS flipped FROM flipped
                "#
            )
        };

        Self {
            create: format!(
                r#"
                INSERT INTO {join} (id, tenant_id, expected_steps, status, metadata)
                VALUES ($1, $2, $3, 'pending', $4)
                "#
            ),
            attach: format!(
                r#"
                INSERT INTO {member} (join_id, work_item_id, state)
                VALUES ($1, $2, 'pending')
                ON CONFLICT (join_id, work_item_id) DO NOTHING
                "#
            ),
            increment_completed: increment("completed", "completed_steps", "failed_steps"),
            increment_failed: increment("failed", "failed_steps", "completed_steps"),
            update_status: format!(
                "UPDATE {join} SET status = $2, last_updated_on = NOW() WHERE id = $1"
            ),
            get_join: format!(
                r#"
                SELECT id, tenant_id, expected_steps, completed_steps, failed_steps,
                       status, metadata, created_on, last_updated_on
                FROM {join}
                WHERE id = $1
                "#
            ),
            get_members: format!(
                r#"
                SELECT join_id, work_item_id, state, created_on
                FROM {member}
                WHERE join_id = $1
                ORDER BY created_on, work_item_id
                "#
            ),
        }
    }
}

/// Join persistence over the same database as the work-item table.
pub struct PgJoinStore {
    pool: PgPool,
    sql: JoinSql,
}

impl PgJoinStore {
    pub fn new(pool: PgPool, settings: PgStoreSettings) -> Result<Self> {
        settings.validate()?;
        let sql = JoinSql::render(&settings);
        Ok(Self { pool, sql })
    }

    async fn increment(&self, sql: &str, join_id: JoinId, work_item_id: &WorkItemId) -> Result<bool> {
        let row = sqlx::query(sql)
            .bind(join_id.as_uuid())
            .bind(work_item_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let flipped: i64 = row.try_get("flipped").map_err(db_err)?;
        Ok(flipped > 0)
    }
}

fn map_join(row: &PgRow) -> Result<Join> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Join {
        id: JoinId::from(row.try_get::<Uuid, _>("id").map_err(db_err)?),
        tenant_id: row.try_get("tenant_id").map_err(db_err)?,
        expected_steps: row.try_get("expected_steps").map_err(db_err)?,
        completed_steps: row.try_get("completed_steps").map_err(db_err)?,
        failed_steps: row.try_get("failed_steps").map_err(db_err)?,
        status: status.parse()?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        created_on: row.try_get("created_on").map_err(db_err)?,
        last_updated_on: row.try_get("last_updated_on").map_err(db_err)?,
    })
}

#[async_trait]
impl JoinStore for PgJoinStore {
    async fn create_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId> {
        mailroom::join::validate_expected_steps(expected_steps)?;
        let id = JoinId::random();
        sqlx::query(&self.sql.create)
            .bind(id.as_uuid())
            .bind(tenant_id)
            .bind(expected_steps)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn attach(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<()> {
        sqlx::query(&self.sql.attach)
            .bind(join_id.as_uuid())
            .bind(work_item_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_completed(
        &self,
        join_id: JoinId,
        work_item_id: &WorkItemId,
    ) -> Result<bool> {
        self.increment(&self.sql.increment_completed, join_id, work_item_id)
            .await
    }

    async fn increment_failed(&self, join_id: JoinId, work_item_id: &WorkItemId) -> Result<bool> {
        self.increment(&self.sql.increment_failed, join_id, work_item_id)
            .await
    }

    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()> {
        let result = sqlx::query(&self.sql.update_status)
            .bind(join_id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(MailroomError::NotFound(format!("join {join_id}")));
        }
        Ok(())
    }

    async fn get_join(&self, join_id: JoinId) -> Result<Join> {
        let row = sqlx::query(&self.sql.get_join)
            .bind(join_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| MailroomError::NotFound(format!("join {join_id}")))?;
        map_join(&row)
    }

    async fn get_members(&self, join_id: JoinId) -> Result<Vec<JoinMember>> {
        let rows = sqlx::query(&self.sql.get_members)
            .bind(join_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.try_get("state").map_err(db_err)?;
            let work_item_id: String = row.try_get("work_item_id").map_err(db_err)?;
            members.push(JoinMember {
                join_id: JoinId::from(row.try_get::<Uuid, _>("join_id").map_err(db_err)?),
                work_item_id: WorkItemId::new(work_item_id),
                state: state.parse()?,
                created_on: row.try_get("created_on").map_err(db_err)?,
            });
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increments_flip_before_counting() {
        let settings = PgStoreSettings::new("postgres://localhost/app").table("outbox");
        let sql = JoinSql::render(&settings);
        for statement in [&sql.increment_completed, &sql.increment_failed] {
            assert!(statement.contains("state = 'pending'"), "{statement}");
            assert!(statement.contains("LEAST"), "{statement}");
        }
        assert!(sql.increment_completed.contains("completed_steps"));
        assert!(sql.increment_failed.contains("failed_steps"));
    }

    #[test]
    fn test_attach_is_idempotent() {
        let settings = PgStoreSettings::new("postgres://localhost/app");
        let sql = JoinSql::render(&settings);
        assert!(sql.attach.contains("ON CONFLICT (join_id, work_item_id) DO NOTHING"));
    }
}

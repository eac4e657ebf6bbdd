//! Postgres-backed task store.
//!
//! Acquisition and repair use `FOR UPDATE SKIP LOCKED` claim CTEs so
//! concurrent acquirers never block each other and never double-assign a
//! row. Completion is a conditional update on (id, state, attempts): zero
//! rows affected means a newer attempt already superseded the caller.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::{ObjectRecord, ObjectStore, StoreError, StoreResult, TaskStore};
use crate::task::{KvMap, Task, TaskAction, TaskOutcome, TaskState, MAX_ATTEMPTS};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema. Statements are idempotent (`IF NOT EXISTS`).
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, sqlx::Error> {
    let action_raw: String = row.try_get("action")?;
    let action = TaskAction::parse(&action_raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown action {action_raw:?}").into()))?;
    let state_raw: String = row.try_get("state")?;
    let state = TaskState::parse(&state_raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown state {state_raw:?}").into()))?;
    Ok(Task {
        id: row.try_get("id")?,
        action,
        payload: row.try_get::<Json<KvMap>, _>("payload")?.0,
        state,
        attempts: row.try_get("attempts")?,
        result: row.try_get::<Json<KvMap>, _>("result")?.0,
        error: row.try_get::<Json<KvMap>, _>("error")?.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        delayed_until: row.try_get("delayed_until")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn enqueue(&self, action: TaskAction, payload: KvMap) -> StoreResult<i64> {
        let row = sqlx::query(
            "INSERT INTO tasks (action, payload, state) VALUES ($1, $2, 'SCHEDULED') RETURNING id",
        )
        .bind(action.as_str())
        .bind(Json(&payload))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicateTask
            } else {
                StoreError::Sqlx(err)
            }
        })?;
        Ok(row.try_get("id").map_err(StoreError::Sqlx)?)
    }

    async fn acquire_next(&self) -> StoreResult<Task> {
        let row = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id
                FROM tasks
                WHERE state IN ('SCHEDULED', 'ERROR')
                  AND (delayed_until IS NULL OR delayed_until <= now())
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks AS t
            SET state = 'ACQUIRED',
                attempts = t.attempts + 1,
                delayed_until = NULL,
                updated_at = now()
            FROM eligible
            WHERE t.id = eligible.id
            RETURNING t.id, t.action, t.payload, t.state, t.attempts,
                      t.result, t.error, t.created_at, t.updated_at, t.delayed_until
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StoreError::NoEligibleTask)?;
        let mut task = task_from_row(&row)?;
        // Thread the attempt counter through the dispatch payload.
        task.payload
            .insert("attempt".to_string(), task.attempts.to_string());
        Ok(task)
    }

    async fn complete_task(&self, id: i64, attempt: i32, outcome: TaskOutcome) -> StoreResult<()> {
        let result = match outcome {
            TaskOutcome::Success(result) => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET state = 'SUCCESS',
                        result = $3,
                        error = '{}'::jsonb,
                        delayed_until = NULL,
                        updated_at = now()
                    WHERE id = $1 AND state = 'ACQUIRED' AND attempts = $2
                    "#,
                )
                .bind(id)
                .bind(attempt)
                .bind(Json(&result))
                .execute(&self.pool)
                .await?
            }
            TaskOutcome::Failure(error) => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET state = CASE WHEN attempts < $3 THEN 'ERROR' ELSE 'CRITICAL_ERROR' END,
                        error = $4,
                        delayed_until = CASE
                            WHEN attempts < $3
                            THEN now() + make_interval(secs => (5 * attempts)::double precision)
                            ELSE NULL
                        END,
                        updated_at = now()
                    WHERE id = $1 AND state = 'ACQUIRED' AND attempts = $2
                    "#,
                )
                .bind(id)
                .bind(attempt)
                .bind(MAX_ATTEMPTS)
                .bind(Json(&error))
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::StaleUpdate);
        }
        Ok(())
    }

    async fn repair_stale(&self, timeout: Duration, batch_size: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM tasks
                WHERE state = 'ACQUIRED'
                  AND updated_at < now() - make_interval(secs => $1)
                ORDER BY updated_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks AS t
            SET state = CASE WHEN t.attempts + 1 < $3 THEN 'ERROR' ELSE 'CRITICAL_ERROR' END,
                delayed_until = CASE
                    WHEN t.attempts + 1 < $3
                    THEN now() + make_interval(secs => (5 * (t.attempts + 1))::double precision)
                    ELSE NULL
                END,
                attempts = t.attempts + 1,
                error = '{"code": "0", "message": "stale task"}'::jsonb,
                updated_at = now()
            FROM stale
            WHERE t.id = stale.id
            "#,
        )
        .bind(timeout.as_secs_f64())
        .bind(batch_size)
        .bind(MAX_ATTEMPTS)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expire_old(&self, ttl: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE state = 'SUCCESS' AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Postgres object source/export destination for the export handler. Each
/// handler owns its own pool handle; the exported-objects primary key backs
/// idempotent export.
#[derive(Clone)]
pub struct PgObjectStore {
    pool: PgPool,
}

impl PgObjectStore {
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a business object; used by the local seed loop.
    pub async fn insert_object(&self, data: &KvMap) -> StoreResult<i64> {
        let row = sqlx::query("INSERT INTO objects (data) VALUES ($1) RETURNING id")
            .bind(Json(data))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id").map_err(StoreError::Sqlx)?)
    }
}

#[async_trait]
impl ObjectStore for PgObjectStore {
    async fn fetch_object(&self, id: i64) -> StoreResult<ObjectRecord> {
        let row = sqlx::query("SELECT id, data FROM objects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ObjectNotFound(id))?;
        Ok(ObjectRecord {
            id: row.try_get("id").map_err(StoreError::Sqlx)?,
            data: row
                .try_get::<Json<KvMap>, _>("data")
                .map_err(StoreError::Sqlx)?
                .0,
        })
    }

    async fn export_object(&self, object: &ObjectRecord) -> StoreResult<()> {
        sqlx::query("INSERT INTO exported_objects (id, data) VALUES ($1, $2)")
            .bind(object.id)
            .bind(Json(&object.data))
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::DuplicateObject
                } else {
                    StoreError::Sqlx(err)
                }
            })?;
        Ok(())
    }
}

//! PostgreSQL implementations of the store traits
//!
//! Production persistence: workflow records, the idempotency index and the
//! audit stream in `mahavishnu_workflows` / `mahavishnu_idempotency` /
//! `mahavishnu_audit_events`, checkpoints in `mahavishnu_checkpoints` keyed
//! by `(workflow_id, version)`. Checkpoint writes are transactional; the
//! version check and the insert commit together, so a stale writer observes
//! `Conflict` and readers only ever see committed versions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use mahavishnu_core::{CorrelationId, Error, Result, TaskId, WorkflowId};

use super::checkpoint::{enforce_size_cap, Checkpoint, CheckpointFilter, CheckpointStore};
use super::workflow_store::{
    AuditEvent, IdempotencyRecord, WorkflowFilter, WorkflowRecord, WorkflowStatus, WorkflowStore,
};

fn db_error(err: sqlx::Error) -> Error {
    error!("database error: {err}");
    Error::internal(format!("database error: {err}"))
}

fn parse_status(raw: &str) -> Result<WorkflowStatus> {
    match raw {
        "created" => Ok(WorkflowStatus::Created),
        "running" => Ok(WorkflowStatus::Running),
        "succeeded" => Ok(WorkflowStatus::Succeeded),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(Error::internal(format!("unknown workflow status: {other}"))),
    }
}

fn parse_workflow_id(raw: &str) -> Result<WorkflowId> {
    raw.parse()
        .map_err(|_| Error::internal(format!("malformed workflow id in store: {raw}")))
}

/// PostgreSQL implementation of [`CheckpointStore`]
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
    max_size_bytes: usize,
}

impl PostgresCheckpointStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool, max_size_bytes: usize) -> Self {
        Self {
            pool,
            max_size_bytes,
        }
    }

    /// Create the backing tables when they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mahavishnu_checkpoints (
                workflow_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                step TEXT NOT NULL,
                state JSONB NOT NULL,
                retained_until TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (workflow_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
        let id: String = row.get("workflow_id");
        let version: i64 = row.get("version");
        Ok(Checkpoint {
            workflow_id: parse_workflow_id(&id)?,
            step: row.get("step"),
            state: row.get("state"),
            version: version as u64,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self, state), fields(%workflow_id, step))]
    async fn put(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64> {
        enforce_size_cap(workflow_id, state, self.max_size_bytes)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Lock the head of the chain; the primary key catches the race
        // between two first writers
        let latest: i64 = sqlx::query(
            r#"
            SELECT version
            FROM mahavishnu_checkpoints
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .map(|row| row.get("version"))
        .unwrap_or(0);

        if latest as u64 != expected_version {
            return Err(Error::conflict("checkpoint version is stale")
                .with_context("workflow_id", workflow_id)
                .with_context("expected", expected_version)
                .with_context("latest", latest));
        }

        let version = latest + 1;
        sqlx::query(
            r#"
            INSERT INTO mahavishnu_checkpoints (workflow_id, version, step, state)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(version)
        .bind(step)
        .bind(state)
        .execute(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::conflict("checkpoint version raced another writer")
                    .with_context("workflow_id", workflow_id)
            }
            other => db_error(other),
        })?;

        tx.commit().await.map_err(db_error)?;
        debug!(version, "checkpoint committed");
        Ok(version as u64)
    }

    #[instrument(skip(self), fields(%workflow_id))]
    async fn get_latest(&self, workflow_id: WorkflowId) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, version, step, state, created_at
            FROM mahavishnu_checkpoints
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    #[instrument(skip(self), fields(%workflow_id))]
    async fn delete(&self, workflow_id: WorkflowId) -> Result<()> {
        sqlx::query("DELETE FROM mahavishnu_checkpoints WHERE workflow_id = $1")
            .bind(workflow_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list(&self, filter: CheckpointFilter) -> Result<Vec<Checkpoint>> {
        let limit = if filter.limit == 0 {
            i64::MAX
        } else {
            filter.limit as i64
        };

        let rows = match filter.workflow_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    SELECT workflow_id, version, step, state, created_at
                    FROM mahavishnu_checkpoints
                    WHERE workflow_id = $1
                    ORDER BY version DESC
                    LIMIT $2
                    "#,
                )
                .bind(id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT workflow_id, version, step, state, created_at
                    FROM mahavishnu_checkpoints
                    ORDER BY workflow_id DESC, version DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn retain_until(&self, workflow_id: WorkflowId, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE mahavishnu_checkpoints SET retained_until = $2 WHERE workflow_id = $1",
        )
        .bind(workflow_id.to_string())
        .bind(until)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn gc_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM mahavishnu_checkpoints
            WHERE workflow_id IN (
                SELECT DISTINCT workflow_id
                FROM mahavishnu_checkpoints
                WHERE retained_until IS NOT NULL AND retained_until <= $1
            )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn probe_writable(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| Error::dependency_down(format!("checkpoint store unreachable: {err}")))?;
        Ok(())
    }
}

/// PostgreSQL implementation of [`WorkflowStore`]
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables when they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mahavishnu_workflows (
                id TEXT PRIMARY KEY,
                task_ref TEXT NOT NULL,
                task_type TEXT NOT NULL,
                params JSONB NOT NULL,
                adapter TEXT,
                status TEXT NOT NULL,
                current_step TEXT,
                steps_total INTEGER NOT NULL,
                steps_completed INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mahavishnu_idempotency (
                key TEXT PRIMARY KEY,
                params_fingerprint TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mahavishnu_audit_events (
                seq BIGSERIAL PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                name TEXT NOT NULL,
                detail JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<WorkflowRecord> {
        let id: String = row.get("id");
        let task_ref: String = row.get("task_ref");
        let status: String = row.get("status");
        let steps_total: i32 = row.get("steps_total");
        let steps_completed: i32 = row.get("steps_completed");
        Ok(WorkflowRecord {
            id: parse_workflow_id(&id)?,
            task_ref: task_ref
                .parse::<TaskId>()
                .map_err(|_| Error::internal("malformed task id in store"))?,
            task_type: row.get("task_type"),
            params: row.get("params"),
            adapter: row.get("adapter"),
            status: parse_status(&status)?,
            current_step: row.get("current_step"),
            steps_total: steps_total as u32,
            steps_completed: steps_completed as u32,
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, record), fields(workflow_id = %record.id))]
    async fn create(&self, record: WorkflowRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mahavishnu_workflows
                (id, task_ref, task_type, params, adapter, status, current_step,
                 steps_total, steps_completed, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.task_ref.to_string())
        .bind(&record.task_type)
        .bind(&record.params)
        .bind(&record.adapter)
        .bind(record.status.to_string())
        .bind(&record.current_step)
        .bind(record.steps_total as i32)
        .bind(record.steps_completed as i32)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::conflict("workflow record already exists")
                    .with_context("workflow_id", record.id)
            }
            other => db_error(other),
        })?;
        Ok(())
    }

    async fn get(&self, id: WorkflowId) -> Result<WorkflowRecord> {
        let row = sqlx::query("SELECT * FROM mahavishnu_workflows WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::not_found("unknown workflow").with_context("workflow_id", id))?;
        Self::row_to_record(&row)
    }

    #[instrument(skip(self), fields(%id, %status))]
    async fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(Error::conflict("workflow status may only move forward")
                .with_context("workflow_id", id)
                .with_context("from", current.status)
                .with_context("to", status));
        }

        // Guard the transition in SQL as well so concurrent updaters race safely
        let result = sqlx::query(
            r#"
            UPDATE mahavishnu_workflows
            SET status = $2, last_error = $3, updated_at = now()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id.to_string())
        .bind(status.to_string())
        .bind(&last_error)
        .bind(current.status.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::conflict("workflow status changed concurrently")
                .with_context("workflow_id", id));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        id: WorkflowId,
        current_step: &str,
        steps_completed: u32,
        adapter: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE mahavishnu_workflows
            SET current_step = $2,
                steps_completed = $3,
                adapter = COALESCE($4, adapter),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(current_step)
        .bind(steps_completed as i32)
        .bind(&adapter)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("unknown workflow").with_context("workflow_id", id));
        }
        Ok(())
    }

    async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mahavishnu_workflows
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR adapter = $2)
            ORDER BY id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(&filter.adapter)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn count_running_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM mahavishnu_workflows
            WHERE status = 'running' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?
        .get("count");
        Ok(count as usize)
    }

    async fn put_idempotency(&self, record: IdempotencyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mahavishnu_idempotency (key, params_fingerprint, workflow_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET params_fingerprint = EXCLUDED.params_fingerprint,
                workflow_id = EXCLUDED.workflow_id,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&record.key)
        .bind(&record.params_fingerprint)
        .bind(record.workflow_id.to_string())
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, params_fingerprint, workflow_id, expires_at
            FROM mahavishnu_idempotency
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            let workflow_id: String = row.get("workflow_id");
            Ok(IdempotencyRecord {
                key: row.get("key"),
                params_fingerprint: row.get("params_fingerprint"),
                workflow_id: parse_workflow_id(&workflow_id)?,
                expires_at: row.get("expires_at"),
            })
        })
        .transpose()
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mahavishnu_audit_events
                (workflow_id, correlation_id, name, detail, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.workflow_id.to_string())
        .bind(event.correlation_id.to_string())
        .bind(&event.name)
        .bind(&event.detail)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_audit(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, correlation_id, name, detail, recorded_at
            FROM mahavishnu_audit_events
            WHERE workflow_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .map(|row| {
                let workflow_id: String = row.get("workflow_id");
                let correlation_id: String = row.get("correlation_id");
                Ok(AuditEvent {
                    workflow_id: parse_workflow_id(&workflow_id)?,
                    correlation_id: correlation_id
                        .parse::<CorrelationId>()
                        .map_err(|_| Error::internal("malformed correlation id in store"))?,
                    name: row.get("name"),
                    detail: row.get("detail"),
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }
}

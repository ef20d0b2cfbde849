//! Postgres store.
//!
//! All queries are plain SQL with binds. Find-or-create operations rely on
//! `INSERT .. ON CONFLICT DO NOTHING RETURNING` and re-read on conflict,
//! which is the required handling for the unique-constraint race between
//! concurrent creators.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use async_trait::async_trait;

use super::{RowLockFn, Store, StoreError, StoreResult};
use crate::error::Error;
use crate::model::{
    ErrorLog, ExecutionLog, NewErrorLog, NewStep, NewWorkflow, StepPatch, StepState, Workflow,
    WorkflowPatch, WorkflowState,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the persisted schema. State columns are integers:
    /// workflows idle=0/running=1/completed=2/failed=3/stalled=4,
    /// execution logs pending=0/completed=1/failed=2.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id BIGSERIAL PRIMARY KEY,
                key TEXT NOT NULL,
                job_class TEXT NOT NULL,
                kwargs JSONB NOT NULL DEFAULT '{}'::jsonb,
                options JSONB NOT NULL DEFAULT '{}'::jsonb,
                context JSONB NOT NULL DEFAULT '{}'::jsonb,
                state INTEGER NOT NULL DEFAULT 0,
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_job_class_key
                ON workflows(job_class, key);
            CREATE INDEX IF NOT EXISTS idx_workflows_key ON workflows(key);

            CREATE TABLE IF NOT EXISTS execution_logs (
                id BIGSERIAL PRIMARY KEY,
                workflow_id BIGINT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                step_name TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ,
                last_executed_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                metadata JSONB,
                state INTEGER NOT NULL DEFAULT 0,
                error_class TEXT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_execution_logs_workflow_step
                ON execution_logs(workflow_id, step_name);

            CREATE TABLE IF NOT EXISTS error_logs (
                id BIGSERIAL PRIMARY KEY,
                workflow_id BIGINT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                error_class TEXT,
                error_message TEXT,
                backtrace TEXT,
                context JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_error_logs_workflow
                ON error_logs(workflow_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn workflow_from_row(row: &PgRow) -> StoreResult<Workflow> {
    let state: i32 = row.try_get("state")?;
    Ok(Workflow {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        job_class: row.try_get("job_class")?,
        kwargs: row.try_get("kwargs")?,
        options: row.try_get("options")?,
        context: row.try_get("context")?,
        state: WorkflowState::from_i32(state)
            .ok_or_else(|| StoreError::Message(format!("unknown workflow state {state}")))?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<ExecutionLog> {
    let state: i32 = row.try_get("state")?;
    let metadata: Option<Value> = row.try_get("metadata")?;
    Ok(ExecutionLog {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        step_name: row.try_get("step_name")?,
        attempts: row.try_get("attempts")?,
        started_at: row.try_get("started_at")?,
        last_executed_at: row.try_get("last_executed_at")?,
        completed_at: row.try_get("completed_at")?,
        metadata: metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        state: StepState::from_i32(state)
            .ok_or_else(|| StoreError::Message(format!("unknown step state {state}")))?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn error_log_from_row(row: &PgRow) -> StoreResult<ErrorLog> {
    let context: Option<Value> = row.try_get("context")?;
    Ok(ErrorLog {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
        backtrace: row.try_get("backtrace")?,
        context: context.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: NewWorkflow,
    ) -> StoreResult<Workflow> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflows (key, job_class, kwargs, options, state, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_class, key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(key)
        .bind(job_class)
        .bind(&init.kwargs)
        .bind(&init.options)
        .bind(WorkflowState::Idle as i32)
        .bind(init.started_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return workflow_from_row(&row);
        }

        // A concurrent create won the race; take the find side.
        let row = sqlx::query("SELECT * FROM workflows WHERE job_class = $1 AND key = $2")
            .bind(job_class)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        workflow_from_row(&row)
    }

    async fn workflow_by_key(
        &self,
        job_class: &str,
        key: &str,
    ) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE job_class = $1 AND key = $2")
            .bind(job_class)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| workflow_from_row(&row)).transpose()
    }

    async fn reload_workflow(&self, workflow_id: i64) -> StoreResult<Workflow> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow_from_row(&row)
    }

    async fn update_workflow(&self, workflow_id: i64, patch: WorkflowPatch) -> StoreResult<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE workflows SET updated_at = NOW()");
        if let Some(state) = patch.state {
            builder.push(", state = ").push_bind(state as i32);
        }
        if let Some(context) = patch.context {
            builder.push(", context = ").push_bind(context);
        }
        if let Some(completed_at) = patch.completed_at {
            builder.push(", completed_at = ").push_bind(completed_at);
        }
        builder.push(" WHERE id = ").push_bind(workflow_id);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn with_row_lock(&self, workflow_id: i64, f: RowLockFn) -> Result<Workflow, Error> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let mut workflow = workflow_from_row(&row)?;

        // Closure errors drop the transaction, rolling the lock back.
        f(&mut workflow)?;

        let updated_at: DateTime<Utc> = Utc::now();
        sqlx::query(
            r#"
            UPDATE workflows
            SET locked_by = $2, locked_at = $3, state = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(&workflow.locked_by)
        .bind(workflow.locked_at)
        .bind(workflow.state as i32)
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;

        workflow.updated_at = updated_at;
        Ok(workflow)
    }

    async fn find_or_create_step(
        &self,
        workflow_id: i64,
        step_name: &str,
        init: NewStep,
    ) -> StoreResult<ExecutionLog> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO execution_logs (workflow_id, step_name, metadata, state, started_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, step_name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(step_name)
        .bind(&init.metadata)
        .bind(StepState::Pending as i32)
        .bind(init.started_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return step_from_row(&row);
        }

        let row = sqlx::query(
            "SELECT * FROM execution_logs WHERE workflow_id = $1 AND step_name = $2",
        )
        .bind(workflow_id)
        .bind(step_name)
        .fetch_one(&self.pool)
        .await?;
        step_from_row(&row)
    }

    async fn update_step(&self, step_id: i64, patch: StepPatch) -> StoreResult<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE execution_logs SET updated_at = NOW()");
        if let Some(state) = patch.state {
            builder.push(", state = ").push_bind(state as i32);
        }
        if let Some(attempts) = patch.attempts {
            builder.push(", attempts = ").push_bind(attempts);
        }
        if let Some(last_executed_at) = patch.last_executed_at {
            builder
                .push(", last_executed_at = ")
                .push_bind(last_executed_at);
        }
        if let Some(completed_at) = patch.completed_at {
            builder.push(", completed_at = ").push_bind(completed_at);
        }
        if let Some(metadata) = patch.metadata {
            builder.push(", metadata = ").push_bind(metadata);
        }
        if let Some(error_class) = patch.error_class {
            builder.push(", error_class = ").push_bind(error_class);
        }
        if let Some(error_message) = patch.error_message {
            builder.push(", error_message = ").push_bind(error_message);
        }
        builder.push(" WHERE id = ").push_bind(step_id);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn steps_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ExecutionLog>> {
        let rows = sqlx::query("SELECT * FROM execution_logs WHERE workflow_id = $1 ORDER BY id")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn insert_error_log(&self, error: NewErrorLog) -> StoreResult<ErrorLog> {
        let row = sqlx::query(
            r#"
            INSERT INTO error_logs (workflow_id, error_class, error_message, backtrace, context)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(error.workflow_id)
        .bind(&error.error_class)
        .bind(&error.error_message)
        .bind(&error.backtrace)
        .bind(&error.context)
        .fetch_one(&self.pool)
        .await?;
        error_log_from_row(&row)
    }

    async fn error_logs_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ErrorLog>> {
        let rows = sqlx::query("SELECT * FROM error_logs WHERE workflow_id = $1 ORDER BY id")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(error_log_from_row).collect()
    }
}

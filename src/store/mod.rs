//! Persistence interfaces for workflow, step, and error rows.
//!
//! Two implementations share one trait: [`PostgresStore`] for production
//! and [`MemoryStore`] for tests and local runs. Both uphold the same
//! contracts: find-or-create operations are atomic upserts that fall back
//! to the "find" side when a concurrent create wins the race, and
//! [`Store::with_row_lock`] gives the caller a single-writer transaction
//! over one workflow row.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{
    ErrorLog, ExecutionLog, NewErrorLog, NewStep, NewWorkflow, StepPatch, Workflow, WorkflowPatch,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("workflow {0} not found")]
    WorkflowNotFound(i64),
    #[error("execution log {0} not found")]
    StepNotFound(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Mutation applied to a workflow row while its row lock is held. Errors
/// roll the transaction back and propagate unchanged.
pub type RowLockFn = Box<dyn FnOnce(&mut Workflow) -> Result<(), Error> + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic upsert by unique `(job_class, key)`; `init` populates fields
    /// only on create.
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: NewWorkflow,
    ) -> StoreResult<Workflow>;

    async fn workflow_by_key(&self, job_class: &str, key: &str)
        -> StoreResult<Option<Workflow>>;

    async fn reload_workflow(&self, workflow_id: i64) -> StoreResult<Workflow>;

    /// Write the present patch fields; lease columns are reachable only
    /// through [`Store::with_row_lock`].
    async fn update_workflow(&self, workflow_id: i64, patch: WorkflowPatch) -> StoreResult<()>;

    /// Open a transaction, select the workflow row for update, run `f`
    /// against the row image, then persist the lease columns and state
    /// (`locked_by`, `locked_at`, `state`) and commit. Returns the row as
    /// written.
    async fn with_row_lock(&self, workflow_id: i64, f: RowLockFn) -> Result<Workflow, Error>;

    /// Atomic upsert by unique `(workflow_id, step_name)`.
    async fn find_or_create_step(
        &self,
        workflow_id: i64,
        step_name: &str,
        init: NewStep,
    ) -> StoreResult<ExecutionLog>;

    async fn update_step(&self, step_id: i64, patch: StepPatch) -> StoreResult<()>;

    /// All steps of a workflow in creation order.
    async fn steps_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ExecutionLog>>;

    async fn insert_error_log(&self, error: NewErrorLog) -> StoreResult<ErrorLog>;

    async fn error_logs_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ErrorLog>>;
}

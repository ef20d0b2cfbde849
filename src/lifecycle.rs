//! Workflow lifecycle transitions and their terminal logs.
//!
//! Terminal completion, terminal failure, and explicit retry each write a
//! reserved step through the same idempotent find-or-create machinery as
//! user steps, so a crash in the middle of a transition resolves cleanly on
//! re-entry: the step is re-found and brought to `completed`.

use chrono::Utc;
use tracing::info;

use crate::error::Error;
use crate::lock::LockManager;
use crate::model::{NewStep, StepPatch, StepState, Workflow, WorkflowPatch, WorkflowState};
use crate::store::Store;

pub const WORKFLOW_COMPLETION_STEP: &str = "$workflow_completion$";
pub const WORKFLOW_FAILURE_PREFIX: &str = "$workflow_failure$";
pub const WORKFLOW_RETRY_PREFIX: &str = "$workflow_retry$";

async fn write_terminal_step(store: &dyn Store, workflow_id: i64, step_name: &str) -> Result<(), Error> {
    let step = store
        .find_or_create_step(
            workflow_id,
            step_name,
            NewStep {
                metadata: serde_json::json!({}),
                started_at: Some(Utc::now()),
            },
        )
        .await?;
    if step.state != StepState::Completed {
        store
            .update_step(
                step.id,
                StepPatch {
                    state: Some(StepState::Completed),
                    attempts: Some(step.attempts + 1),
                    last_executed_at: Some(Utc::now()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}

/// `running → completed`: write the terminal completion log, then mark the
/// workflow completed.
pub async fn complete_workflow(store: &dyn Store, workflow: &Workflow) -> Result<(), Error> {
    write_terminal_step(store, workflow.id, WORKFLOW_COMPLETION_STEP).await?;
    store
        .update_workflow(
            workflow.id,
            WorkflowPatch {
                state: Some(WorkflowState::Completed),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    info!(job_class = %workflow.job_class, key = %workflow.key, "workflow completed");
    Ok(())
}

/// `running → failed`: write the terminal failure log, disambiguated by the
/// error-log row it refers to so repeated terminal failures across explicit
/// retries never collide on the unique step index.
pub async fn fail_workflow(
    store: &dyn Store,
    workflow: &Workflow,
    error_log_id: Option<i64>,
) -> Result<(), Error> {
    let step_name = format!("{WORKFLOW_FAILURE_PREFIX}{}", error_log_id.unwrap_or(0));
    write_terminal_step(store, workflow.id, &step_name).await?;
    store
        .update_workflow(
            workflow.id,
            WorkflowPatch {
                state: Some(WorkflowState::Failed),
                ..Default::default()
            },
        )
        .await?;
    info!(
        job_class = %workflow.job_class,
        key = %workflow.key,
        error_log_id = error_log_id.unwrap_or(0),
        "workflow failed terminally"
    );
    Ok(())
}

/// `running → stalled`: a step explicitly exhausted its retries.
pub async fn mark_stalled(store: &dyn Store, workflow: &Workflow) -> Result<(), Error> {
    store
        .update_workflow(
            workflow.id,
            WorkflowPatch {
                state: Some(WorkflowState::Stalled),
                ..Default::default()
            },
        )
        .await?;
    info!(job_class = %workflow.job_class, key = %workflow.key, "workflow stalled");
    Ok(())
}

/// `{stalled, failed} → idle`: the explicit-retry transition. Writes the
/// retry log and force-releases the lease; the caller decides whether the
/// re-entry runs inline or goes through the job queue.
pub async fn begin_retry(
    store: &dyn Store,
    lock: &LockManager,
    workflow: &Workflow,
) -> Result<Workflow, Error> {
    if !workflow.state.is_retryable() {
        return Err(Error::NotRetryable {
            key: workflow.key.clone(),
            state: workflow.state,
        });
    }
    let step_name = format!("{WORKFLOW_RETRY_PREFIX}{}", Utc::now().timestamp());
    write_terminal_step(store, workflow.id, &step_name).await?;
    let workflow = lock.release(store, workflow.id, true).await?;
    info!(job_class = %workflow.job_class, key = %workflow.key, "workflow reset for retry");
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkflow;
    use crate::store::MemoryStore;

    async fn seeded(store: &MemoryStore) -> Workflow {
        store
            .find_or_create_workflow("demo", "k1", NewWorkflow::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completion_is_idempotent_across_reentries() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;

        complete_workflow(&store, &workflow).await.unwrap();
        // Crash-and-replay: a second completion re-finds the same log.
        complete_workflow(&store, &workflow).await.unwrap();

        let steps = store.steps_for_workflow(workflow.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_name, WORKFLOW_COMPLETION_STEP);
        assert_eq!(steps[0].state, StepState::Completed);

        let reloaded = store.reload_workflow(workflow.id).await.unwrap();
        assert_eq!(reloaded.state, WorkflowState::Completed);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_log_is_disambiguated_by_error_log_id() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;

        fail_workflow(&store, &workflow, Some(41)).await.unwrap();
        let steps = store.steps_for_workflow(workflow.id).await.unwrap();
        assert_eq!(steps[0].step_name, "$workflow_failure$41");

        let reloaded = store.reload_workflow(workflow.id).await.unwrap();
        assert_eq!(reloaded.state, WorkflowState::Failed);
    }

    #[tokio::test]
    async fn retry_requires_a_stalled_or_failed_workflow() {
        let store = MemoryStore::new();
        let lock = LockManager::default();
        let workflow = seeded(&store).await;

        let err = begin_retry(&store, &lock, &workflow).await.unwrap_err();
        assert!(matches!(err, Error::NotRetryable { .. }));

        store
            .update_workflow(
                workflow.id,
                WorkflowPatch {
                    state: Some(WorkflowState::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let workflow = store.reload_workflow(workflow.id).await.unwrap();

        let reset = begin_retry(&store, &lock, &workflow).await.unwrap();
        assert_eq!(reset.state, WorkflowState::Idle);
        assert_eq!(reset.locked_by, None);

        let steps = store.steps_for_workflow(workflow.id).await.unwrap();
        assert!(steps[0].step_name.starts_with(WORKFLOW_RETRY_PREFIX));
        assert_eq!(steps[0].state, StepState::Completed);
    }
}

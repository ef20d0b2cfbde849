//! Single-writer workflow leases with wall-clock staleness.
//!
//! A lease is the `(locked_by, locked_at)` pair on the workflow row. There
//! are no heartbeats: a lease older than `max_duration` is considered dead
//! and may be broken by any other executor. Bounded work per entry (every
//! primitive halts at its suspension point) keeps honest holders well
//! inside the window.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{Workflow, WorkflowState};
use crate::store::Store;

/// Default lease window before another executor may take over.
pub const DEFAULT_LOCK_MAX_DURATION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct LockManager {
    executor_id: String,
    max_duration: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_MAX_DURATION)
    }
}

impl LockManager {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            executor_id: Uuid::new_v4().to_string(),
            max_duration,
        }
    }

    pub fn with_executor_id(executor_id: impl Into<String>, max_duration: Duration) -> Self {
        Self {
            executor_id: executor_id.into(),
            max_duration,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Take the lease and move the workflow to `running`.
    ///
    /// Fails with [`Error::ConcurrentExecution`] when a lease younger than
    /// `max_duration` exists, regardless of owner; a stale lease is broken
    /// silently.
    pub async fn acquire(&self, store: &dyn Store, workflow_id: i64) -> Result<Workflow, Error> {
        let executor_id = self.executor_id.clone();
        let max_duration = chrono::Duration::from_std(self.max_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let workflow = store
            .with_row_lock(
                workflow_id,
                Box::new(move |workflow| {
                    let now = Utc::now();
                    if let Some(locked_at) = workflow.locked_at {
                        if locked_at > now - max_duration {
                            return Err(Error::ConcurrentExecution {
                                key: workflow.key.clone(),
                            });
                        }
                        warn!(
                            key = %workflow.key,
                            stale_owner = workflow.locked_by.as_deref().unwrap_or(""),
                            locked_at = %locked_at,
                            "breaking stale workflow lease"
                        );
                    }
                    workflow.locked_by = Some(executor_id.clone());
                    workflow.locked_at = Some(now);
                    workflow.state = WorkflowState::Running;
                    Ok(())
                }),
            )
            .await?;

        debug!(key = %workflow.key, executor_id = %self.executor_id, "lease acquired");
        Ok(workflow)
    }

    /// Clear the lease. Without `force`, a lease now owned by someone else
    /// fails with [`Error::LongRunningConcurrentExecution`]: this entry ran
    /// past `max_duration` and a replacement took over, so the row belongs
    /// to them. A `running` workflow is demoted to `idle`; terminal states
    /// are left alone unless `force` (the explicit-retry path, which also
    /// demotes stalled/failed).
    pub async fn release(
        &self,
        store: &dyn Store,
        workflow_id: i64,
        force: bool,
    ) -> Result<Workflow, Error> {
        let executor_id = self.executor_id.clone();

        let workflow = store
            .with_row_lock(
                workflow_id,
                Box::new(move |workflow| {
                    if !force && workflow.locked_by.as_deref() != Some(executor_id.as_str()) {
                        return Err(Error::LongRunningConcurrentExecution {
                            key: workflow.key.clone(),
                            current_owner: workflow.locked_by.clone().unwrap_or_default(),
                        });
                    }
                    workflow.locked_by = None;
                    workflow.locked_at = None;
                    if force || workflow.state == WorkflowState::Running {
                        workflow.state = WorkflowState::Idle;
                    }
                    Ok(())
                }),
            )
            .await?;

        debug!(key = %workflow.key, executor_id = %self.executor_id, force, "lease released");
        Ok(workflow)
    }
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
    async fn acquire_takes_the_lease_and_marks_running() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let manager = LockManager::default();

        let locked = manager.acquire(&store, workflow.id).await.unwrap();
        assert_eq!(locked.locked_by.as_deref(), Some(manager.executor_id()));
        assert!(locked.locked_at.is_some());
        assert_eq!(locked.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn fresh_lease_blocks_other_executors() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let first = LockManager::default();
        let second = LockManager::default();

        first.acquire(&store, workflow.id).await.unwrap();
        let err = second.acquire(&store, workflow.id).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentExecution { .. }));

        // The original lease is untouched.
        let reloaded = store.reload_workflow(workflow.id).await.unwrap();
        assert_eq!(reloaded.locked_by.as_deref(), Some(first.executor_id()));
    }

    #[tokio::test]
    async fn stale_lease_is_broken() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let dead = LockManager::with_executor_id("ghost", Duration::from_millis(10));
        let live = LockManager::new(Duration::from_millis(10));

        dead.acquire(&store, workflow.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let locked = live.acquire(&store, workflow.id).await.unwrap();
        assert_eq!(locked.locked_by.as_deref(), Some(live.executor_id()));
    }

    #[tokio::test]
    async fn release_demotes_running_to_idle() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let manager = LockManager::default();

        manager.acquire(&store, workflow.id).await.unwrap();
        let released = manager.release(&store, workflow.id, false).await.unwrap();
        assert_eq!(released.state, WorkflowState::Idle);
        assert_eq!(released.locked_by, None);
        assert_eq!(released.locked_at, None);
    }

    #[tokio::test]
    async fn release_keeps_terminal_states() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let manager = LockManager::default();

        manager.acquire(&store, workflow.id).await.unwrap();
        store
            .update_workflow(
                workflow.id,
                crate::model::WorkflowPatch {
                    state: Some(WorkflowState::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let released = manager.release(&store, workflow.id, false).await.unwrap();
        assert_eq!(released.state, WorkflowState::Completed);
        assert_eq!(released.locked_by, None);
    }

    #[tokio::test]
    async fn release_by_a_stranger_without_force_fails() {
        let store = MemoryStore::new();
        let workflow = seeded(&store).await;
        let owner = LockManager::default();
        let stranger = LockManager::default();

        owner.acquire(&store, workflow.id).await.unwrap();
        let err = stranger.release(&store, workflow.id, false).await.unwrap_err();
        assert!(matches!(err, Error::LongRunningConcurrentExecution { .. }));

        let forced = stranger.release(&store, workflow.id, true).await.unwrap();
        assert_eq!(forced.locked_by, None);
        assert_eq!(forced.state, WorkflowState::Idle);
    }
}

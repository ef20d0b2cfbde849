//! The executor driver: the entrypoint the job system calls.
//!
//! One `perform` call is one entry: ensure the workflow row exists, take
//! the lease, replay the body, then settle the outcome — completion,
//! scheduled retry, terminal failure, or stall — and always hand the lease
//! back.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::Error;
use crate::lifecycle;
use crate::lock::{LockManager, DEFAULT_LOCK_MAX_DURATION};
use crate::model::{NewWorkflow, Workflow};
use crate::primitives::Execution;
use crate::queue::{JobQueue, JobRequest};
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreError};
use crate::tracker;
use crate::workflow::{WorkflowHandler, WorkflowRegistry};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Lease window before another executor may assume a holder is dead.
    pub lock_max_duration: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lock_max_duration: DEFAULT_LOCK_MAX_DURATION,
        }
    }
}

/// Per-entry payload of [`WorkflowExecutor::perform`].
#[derive(Debug, Clone)]
pub struct PerformOptions {
    pub attempt: i32,
    pub retry_workflow: bool,
    pub options: Value,
    pub kwargs: Value,
}

impl Default for PerformOptions {
    fn default() -> Self {
        Self {
            attempt: 0,
            retry_workflow: false,
            options: Value::Object(serde_json::Map::new()),
            kwargs: Value::Object(serde_json::Map::new()),
        }
    }
}

impl From<&JobRequest> for PerformOptions {
    fn from(job: &JobRequest) -> Self {
        Self {
            attempt: job.attempt,
            retry_workflow: job.retry_workflow,
            options: job.options.clone(),
            kwargs: job.kwargs.clone(),
        }
    }
}

pub struct WorkflowExecutor {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    registry: WorkflowRegistry,
    lock: LockManager,
    retry_policy: RetryPolicy,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self::with_config(store, queue, ExecutorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry: WorkflowRegistry::new(),
            lock: LockManager::new(config.lock_max_duration),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn WorkflowHandler>) {
        self.registry.register(handler);
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn executor_id(&self) -> &str {
        self.lock.executor_id()
    }

    /// Submit a workflow and run its first entry inline.
    pub async fn submit(
        &self,
        job_class: &str,
        key: &str,
        kwargs: Value,
        options: Value,
    ) -> Result<Workflow, Error> {
        self.perform(
            job_class,
            key,
            PerformOptions {
                kwargs,
                options,
                ..Default::default()
            },
        )
        .await?;
        Ok(self
            .store
            .workflow_by_key(job_class, key)
            .await?
            .ok_or(StoreError::WorkflowNotFound(0))?)
    }

    /// Submit a workflow through the job queue instead of running inline.
    pub async fn submit_async(
        &self,
        job_class: &str,
        key: &str,
        kwargs: Value,
        options: Value,
    ) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        self.queue
            .enqueue_now(JobRequest {
                job_class: job_class.to_string(),
                key: key.to_string(),
                attempt: 0,
                retry_workflow: false,
                options,
                kwargs,
            })
            .await?;
        Ok(())
    }

    /// Re-run a stalled or failed workflow, inline.
    pub async fn retry_now(&self, job_class: &str, key: &str) -> Result<Workflow, Error> {
        let workflow = self.require_workflow(job_class, key).await?;
        self.perform(
            job_class,
            key,
            PerformOptions {
                retry_workflow: true,
                options: workflow.options.clone(),
                kwargs: workflow.kwargs.clone(),
                ..Default::default()
            },
        )
        .await?;
        Ok(self.store.reload_workflow(workflow.id).await?)
    }

    /// Re-run a stalled or failed workflow through the job queue.
    pub async fn retry_later(&self, job_class: &str, key: &str) -> Result<(), Error> {
        let workflow = self.require_workflow(job_class, key).await?;
        if !workflow.state.is_retryable() {
            return Err(Error::NotRetryable {
                key: workflow.key,
                state: workflow.state,
            });
        }
        self.queue
            .enqueue_now(JobRequest::reentry(&workflow).with_retry_workflow())
            .await?;
        Ok(())
    }

    async fn require_workflow(&self, job_class: &str, key: &str) -> Result<Workflow, Error> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        Ok(self
            .store
            .workflow_by_key(job_class, key)
            .await?
            .ok_or(StoreError::WorkflowNotFound(0))?)
    }

    /// One executor entry. Returns `Ok(())` for every outcome the job
    /// system should not retry on its own — including a dropped entry at
    /// the attempt cap, a lost lock race, and a settled failure.
    pub async fn perform(
        &self,
        job_class: &str,
        key: &str,
        opts: PerformOptions,
    ) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let handler = self
            .registry
            .get(job_class)
            .ok_or_else(|| Error::UnknownJobClass(job_class.to_string()))?;

        if opts.attempt >= self.retry_policy.max_attempts() {
            warn!(
                job_class,
                key,
                attempt = opts.attempt,
                "attempt cap reached; dropping entry"
            );
            return Ok(());
        }

        let workflow = self
            .store
            .find_or_create_workflow(
                job_class,
                key,
                NewWorkflow {
                    kwargs: opts.kwargs.clone(),
                    options: opts.options.clone(),
                    started_at: Some(chrono::Utc::now()),
                },
            )
            .await?;

        let workflow = if opts.retry_workflow {
            // Must hold for stalled/failed rows; anything else is the
            // caller's bug and is rethrown.
            lifecycle::begin_retry(self.store.as_ref(), &self.lock, &workflow).await?
        } else {
            workflow
        };

        // Terminal rows only ever re-run through the retry transition
        // above; a straggling duplicate enqueue is dropped here.
        if workflow.state.is_terminal() {
            debug!(
                job_class,
                key,
                state = %workflow.state,
                "workflow is already terminal; dropping entry"
            );
            return Ok(());
        }

        let workflow = match self.lock.acquire(self.store.as_ref(), workflow.id).await {
            Ok(workflow) => workflow,
            Err(Error::ConcurrentExecution { key }) => {
                warn!(job_class, %key, "workflow is locked by another executor; skipping entry");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // Lease held from here on: settle, persist context, release.
        let context = Context::new(workflow.id, workflow.context.clone());
        let mut exec = Execution::new(
            self.store.as_ref(),
            self.queue.as_ref(),
            workflow.clone(),
            context,
        );

        let run_result = match handler.perform(&mut exec).await {
            Ok(()) => lifecycle::complete_workflow(self.store.as_ref(), &workflow).await,
            Err(err) => Err(err),
        };

        let (_, mut context) = exec.into_parts();
        let mut entry_result = self
            .settle(handler.as_ref(), &workflow, &context, opts.attempt, run_result)
            .await;

        if let Err(err) = context.save(self.store.as_ref()).await {
            warn!(key = %workflow.key, error = %err, "failed to persist workflow context");
            if entry_result.is_ok() {
                entry_result = Err(err);
            }
        }

        match self.lock.release(self.store.as_ref(), workflow.id, false).await {
            Ok(_) => {}
            Err(err @ Error::LongRunningConcurrentExecution { .. }) => {
                // Another executor took over after our lease aged out; the
                // workflow belongs to them now. Record it and walk away.
                warn!(key = %workflow.key, error = %err, "lease was taken over mid-entry");
                let _ =
                    tracker::track(self.store.as_ref(), &workflow, &err, context.snapshot()).await;
            }
            Err(err) => {
                if entry_result.is_ok() {
                    entry_result = Err(err);
                }
            }
        }

        entry_result
    }

    /// Map the body's outcome onto the state machine.
    async fn settle(
        &self,
        handler: &dyn WorkflowHandler,
        workflow: &Workflow,
        context: &Context,
        attempt: i32,
        run_result: Result<(), Error>,
    ) -> Result<(), Error> {
        match run_result {
            Ok(()) => Ok(()),
            Err(Error::Halt) => {
                debug!(key = %workflow.key, "entry halted; awaiting re-entry");
                Ok(())
            }
            Err(err @ Error::ExecutionFailed { .. })
            | Err(err @ Error::WaitConditionNotMet { .. }) => {
                let _ =
                    tracker::track(self.store.as_ref(), workflow, &err, context.snapshot()).await;
                lifecycle::mark_stalled(self.store.as_ref(), workflow).await?;
                Ok(())
            }
            Err(err) => {
                let error_log =
                    tracker::track(self.store.as_ref(), workflow, &err, context.snapshot()).await;
                if handler.should_retry(&err, attempt) {
                    self.retry_policy
                        .schedule_retry(self.queue.as_ref(), workflow, attempt)
                        .await?;
                    Ok(())
                } else {
                    lifecycle::fail_workflow(
                        self.store.as_ref(),
                        workflow,
                        error_log.map(|log| log.id),
                    )
                    .await?;
                    Ok(())
                }
            }
        }
    }
}

//! Job-system seam: delayed re-entry scheduling.
//!
//! The executor never sleeps a thread; every wait is expressed as a delayed
//! enqueue against this trait. Production deployments adapt their background
//! job system; [`MemoryQueue`] backs tests and local runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Workflow;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Message(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Payload for one executor entry, as handed to the job system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_class: String,
    pub key: String,
    pub attempt: i32,
    pub retry_workflow: bool,
    pub options: Value,
    pub kwargs: Value,
}

impl JobRequest {
    /// Re-entry for an existing workflow. Primitive-scheduled re-entries
    /// carry attempt 0; only the retry policy escalates the counter.
    pub fn reentry(workflow: &Workflow) -> Self {
        Self {
            job_class: workflow.job_class.clone(),
            key: workflow.key.clone(),
            attempt: 0,
            retry_workflow: false,
            options: workflow.options.clone(),
            kwargs: workflow.kwargs.clone(),
        }
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_retry_workflow(mut self) -> Self {
        self.retry_workflow = true;
        self
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue_now(&self, job: JobRequest) -> QueueResult<()>;

    async fn enqueue_after(&self, delay: Duration, job: JobRequest) -> QueueResult<()>;
}

/// A job with its not-before timestamp.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub run_at: DateTime<Utc>,
    pub job: JobRequest,
}

/// In-memory queue for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    jobs: Arc<Mutex<Vec<ScheduledJob>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return jobs due at `now`, earliest first.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<JobRequest> {
        let mut guard = self.jobs.lock().expect("job queue poisoned");
        let mut due: Vec<ScheduledJob> = Vec::new();
        guard.retain(|scheduled| {
            if scheduled.run_at <= now {
                due.push(scheduled.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|scheduled| scheduled.run_at);
        due.into_iter().map(|scheduled| scheduled.job).collect()
    }

    /// Earliest pending run time, if any job is queued.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .lock()
            .expect("job queue poisoned")
            .iter()
            .map(|scheduled| scheduled.run_at)
            .min()
    }

    pub fn pending(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().expect("job queue poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().expect("job queue poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job queue poisoned").len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue_now(&self, job: JobRequest) -> QueueResult<()> {
        let mut guard = self.jobs.lock().expect("job queue poisoned");
        guard.push(ScheduledJob {
            run_at: Utc::now(),
            job,
        });
        Ok(())
    }

    async fn enqueue_after(&self, delay: Duration, job: JobRequest) -> QueueResult<()> {
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut guard = self.jobs.lock().expect("job queue poisoned");
        guard.push(ScheduledJob { run_at, job });
        Ok(())
    }
}

//! Workflow-level retry scheduling and backoff arithmetic.

use std::time::Duration;

use tracing::info;

use crate::model::Workflow;
use crate::queue::{JobQueue, JobRequest, QueueError};

/// Workflow re-entry backoff schedule, in seconds. Attempts beyond the end
/// of the table reuse its last entry.
pub const BACKOFF_SCHEDULE_SECS: [u64; 5] = [1, 5, 30, 120, 600];

/// How many workflow-level retries are attempted before an error becomes
/// terminal, unless the workflow overrides `should_retry`.
pub const DEFAULT_RETRY_LIMIT: i32 = 3;

/// Exponent cap for per-step backoff.
const STEP_BACKOFF_MAX_EXPONENT: u32 = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            BACKOFF_SCHEDULE_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        )
    }
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        assert!(!schedule.is_empty(), "retry schedule must not be empty");
        Self { schedule }
    }

    /// Entries with `attempt >= max_attempts()` are dropped by the driver.
    pub fn max_attempts(&self) -> i32 {
        self.schedule.len() as i32
    }

    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let index = attempt.max(0) as usize;
        self.schedule[index.min(self.schedule.len() - 1)]
    }

    /// Enqueue a re-entry for `workflow` carrying `attempt + 1`, after the
    /// backoff for `attempt`.
    pub async fn schedule_retry(
        &self,
        queue: &dyn JobQueue,
        workflow: &Workflow,
        attempt: i32,
    ) -> Result<(), QueueError> {
        let delay = self.delay_for_attempt(attempt);
        info!(
            job_class = %workflow.job_class,
            key = %workflow.key,
            attempt,
            delay_secs = delay.as_secs_f64(),
            "scheduling workflow retry"
        );
        queue
            .enqueue_after(delay, JobRequest::reentry(workflow).with_attempt(attempt + 1))
            .await
    }

    pub fn should_retry_default(attempt_count: i32) -> bool {
        attempt_count < DEFAULT_RETRY_LIMIT
    }
}

/// Backoff before re-attempting a failed step: `2^min(attempts, 5)` seconds.
pub fn step_backoff(attempts: i32) -> Duration {
    let exponent = (attempts.max(0) as u32).min(STEP_BACKOFF_MAX_EXPONENT);
    Duration::from_secs(1 << exponent)
}

//! Persistent row types and their state enums.
//!
//! State enums are stored as integers; the encodings are part of the
//! persisted schema and must not change:
//! workflows: idle=0, running=1, completed=2, failed=3, stalled=4;
//! execution logs: pending=0, completed=1, failed=2.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum WorkflowState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Stalled = 4,
}

impl WorkflowState {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            4 => Some(Self::Stalled),
            _ => None,
        }
    }

    /// Terminal states are immutable except via an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Only stalled and failed workflows accept `retry_now` / `retry_later`.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Stalled | Self::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum StepState {
    Pending = 0,
    Completed = 1,
    Failed = 2,
}

impl StepState {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Completed),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The root workflow instance, unique per `(job_class, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub key: String,
    pub job_class: String,
    pub kwargs: Value,
    pub options: Value,
    pub context: Value,
    pub state: WorkflowState,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per workflow step attempt-set, unique per
/// `(workflow_id, step_name)`. A step is authoritative only when
/// `completed`; anything else may be re-attempted on the next entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub workflow_id: i64,
    pub step_name: String,
    pub attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub state: StepState,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per observed exception, with a context snapshot taken at
/// failure time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    pub id: i64,
    pub workflow_id: i64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields applied only when `find_or_create_workflow` actually creates.
#[derive(Debug, Clone, Default)]
pub struct NewWorkflow {
    pub kwargs: Value,
    pub options: Value,
    pub started_at: Option<DateTime<Utc>>,
}

/// Fields applied only when `find_or_create_step` actually creates.
#[derive(Debug, Clone, Default)]
pub struct NewStep {
    pub metadata: Value,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewErrorLog {
    pub workflow_id: i64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub context: Value,
}

/// Column patch for a workflow row; only present fields are written.
/// Lease columns are owned by the row-lock path and are absent on purpose.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub state: Option<WorkflowState>,
    pub context: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Column patch for an execution log row; only present fields are written.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub state: Option<StepState>,
    pub attempts: Option<i32>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_state_round_trips_through_integers() {
        for state in [
            WorkflowState::Idle,
            WorkflowState::Running,
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Stalled,
        ] {
            assert_eq!(WorkflowState::from_i32(state as i32), Some(state));
        }
        assert_eq!(WorkflowState::from_i32(5), None);
    }

    #[test]
    fn step_state_round_trips_through_integers() {
        for state in [StepState::Pending, StepState::Completed, StepState::Failed] {
            assert_eq!(StepState::from_i32(state as i32), Some(state));
        }
        assert_eq!(StepState::from_i32(3), None);
    }

    #[test]
    fn terminal_and_retryable_classification() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Stalled.is_terminal());

        assert!(WorkflowState::Failed.is_retryable());
        assert!(WorkflowState::Stalled.is_retryable());
        assert!(!WorkflowState::Idle.is_retryable());
        assert!(!WorkflowState::Completed.is_retryable());
    }
}

//! Error taxonomy for the executor.
//!
//! Two families live here: [`Error`], the crate-level taxonomy the driver
//! dispatches on, and [`StepError`], the classified failure type user step
//! code returns. `Error::Halt` is flow control, not a failure: a primitive
//! raises it to abort the current entry while expecting re-entry later.

use crate::model::WorkflowState;
use crate::queue::QueueError;
use crate::store::StoreError;

pub type ExecutorResult<T> = Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A step exhausted its per-step retries.
    #[error("step `{step}` failed permanently: {class}: {message}")]
    ExecutionFailed {
        step: String,
        class: String,
        message: String,
    },

    /// Normal flow control: stop this entry, a re-entry is expected.
    #[error("execution halted pending re-entry")]
    Halt,

    /// Lock acquisition found a fresh lease held by another executor.
    #[error("workflow `{key}` is locked by another executor")]
    ConcurrentExecution { key: String },

    /// Release found the lease owned by someone else: this entry outlived
    /// its lease and another executor took over mid-run.
    #[error("workflow `{key}` lease is now held by `{current_owner}`")]
    LongRunningConcurrentExecution { key: String, current_owner: String },

    /// A polled condition was still false past its timeout.
    #[error("condition `{step}` was not met before its timeout")]
    WaitConditionNotMet { step: String },

    #[error("workflow `{key}` is not retryable from state `{state}`")]
    NotRetryable { key: String, state: WorkflowState },

    #[error("invalid context value for key `{key}`: {reason}")]
    InvalidContextValue { key: String, reason: String },

    /// Entry guard: the workflow key must be a non-empty string.
    #[error("workflow key must be a non-empty string")]
    InvalidKey,

    #[error("step name `{0}` is empty or uses a reserved marker")]
    InvalidStepName(String),

    #[error("no workflow registered for job class `{0}`")]
    UnknownJobClass(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Any other failure raised by user workflow code.
    #[error("{class}: {message}")]
    User { class: String, message: String },
}

impl Error {
    /// Classification string recorded into `error_logs.error_class`.
    pub fn class(&self) -> String {
        match self {
            Error::ExecutionFailed { class, .. } => format!("ExecutionFailed({class})"),
            Error::Halt => "HaltExecution".to_string(),
            Error::ConcurrentExecution { .. } => "ConcurrentExecution".to_string(),
            Error::LongRunningConcurrentExecution { .. } => {
                "LongRunningConcurrentExecution".to_string()
            }
            Error::WaitConditionNotMet { .. } => "WaitConditionNotMet".to_string(),
            Error::NotRetryable { .. } => "WorkflowNotRetryable".to_string(),
            Error::InvalidContextValue { .. } => "InvalidContextValue".to_string(),
            Error::InvalidKey => "InvalidKey".to_string(),
            Error::InvalidStepName(_) => "InvalidStepName".to_string(),
            Error::UnknownJobClass(_) => "UnknownJobClass".to_string(),
            Error::Store(_) => "StoreError".to_string(),
            Error::Queue(_) => "QueueError".to_string(),
            Error::User { class, .. } => class.clone(),
        }
    }
}

/// Classified failure returned from user step closures.
///
/// The `class` feeds the `error_class` columns and the `retry_on` matching
/// of `wait_until`; pick stable names.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct StepError {
    pub class: String,
    pub message: String,
}

impl StepError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            class: "Error".to_string(),
            message: format!("{err:#}"),
        }
    }
}

impl From<Error> for StepError {
    fn from(err: Error) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl From<StepError> for Error {
    fn from(err: StepError) -> Self {
        Error::User {
            class: err.class,
            message: err.message,
        }
    }
}

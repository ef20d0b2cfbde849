//! Belay - durable, resumable workflows on a relational store
//!
//! This crate turns ordinary background-job handlers into resumable,
//! idempotent, long-running state machines whose progress is persisted in
//! a relational database and survives crashes, restarts, and retries. The
//! key components are:
//!
//! ## Execution
//!
//! - [`WorkflowExecutor`]: driver the job system calls for each entry
//! - [`WorkflowHandler`]: the trait user workflow bodies implement
//! - [`Execution`]: the in-body handle exposing the durable primitives
//!   (`durably_execute`, `wait`, `wait_until`, `continue_if`,
//!   `durably_repeat`) and the [`Context`]
//!
//! ## Persistence
//!
//! - [`store::Store`]: transactional row storage with row-level locking,
//!   backed by Postgres ([`PostgresStore`]) or memory ([`MemoryStore`])
//! - [`LockManager`]: single-writer leases with wall-clock staleness
//!
//! ## Scheduling
//!
//! - [`queue::JobQueue`]: delayed re-entry seam to the hosting job system
//! - [`RetryPolicy`]: workflow-level backoff schedule
//!
//! A workflow body re-runs from the top on every entry; the per-step
//! execution log short-circuits everything already completed, so exactly
//! one attempt of the first unfinished step runs per entry. All waits are
//! delayed enqueues plus a halt — no thread ever sleeps on workflow time.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod lock;
pub mod model;
pub mod primitives;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod workflow;

// Configuration
pub use config::Config;

// Execution
pub use error::{Error, ExecutorResult, StepError};
pub use executor::{ExecutorConfig, PerformOptions, WorkflowExecutor};
pub use primitives::{
    Execution, RepeatOnError, RepeatOptions, WaitUntilOptions, DEFAULT_STEP_ATTEMPTS,
};
pub use workflow::{WorkflowHandler, WorkflowRegistry};

// Persistence
pub use context::Context;
pub use lock::{LockManager, DEFAULT_LOCK_MAX_DURATION};
pub use model::{
    ErrorLog, ExecutionLog, NewErrorLog, NewStep, NewWorkflow, StepPatch, StepState, Workflow,
    WorkflowPatch, WorkflowState,
};
pub use store::{MemoryStore, PostgresStore, Store, StoreError};

// Scheduling
pub use queue::{JobQueue, JobRequest, MemoryQueue, QueueError, ScheduledJob};
pub use retry::{RetryPolicy, BACKOFF_SCHEDULE_SECS, DEFAULT_RETRY_LIMIT};

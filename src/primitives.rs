//! Durable step primitives and the in-body execution handle.
//!
//! Every primitive follows one shape: derive the step name, find-or-create
//! its execution log, short-circuit when the log is already `completed`,
//! otherwise perform one attempt and either complete, fail, or halt. A halt
//! ([`Error::Halt`]) aborts the whole entry without failing the workflow;
//! the primitive has already enqueued the re-entry it expects (except
//! `continue_if`, which waits for an external nudge).
//!
//! Replay discipline: the body re-runs from the top on every entry, so the
//! completed-step short-circuit is what preserves program order across
//! entries, and step names must be stable between runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, StepError};
use crate::model::{ExecutionLog, NewStep, StepPatch, StepState, Workflow};
use crate::queue::{JobQueue, JobRequest};
use crate::retry::step_backoff;
use crate::store::Store;
use crate::tracker;

/// Default per-step attempt budget for `durably_execute`.
pub const DEFAULT_STEP_ATTEMPTS: i32 = 3;

/// Defaults for [`Execution::wait_until`].
#[derive(Debug, Clone)]
pub struct WaitUntilOptions {
    /// Give up once `now > created_at + timeout`.
    pub timeout: Duration,
    /// Delay between condition polls.
    pub check_interval: Duration,
    /// Error classes that reschedule the poll instead of failing the step.
    pub retry_on: Vec<String>,
}

impl Default for WaitUntilOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            check_interval: Duration::from_secs(15 * 60),
            retry_on: Vec::new(),
        }
    }
}

/// What to do when a `durably_repeat` tick exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatOnError {
    /// Skip the tick and keep the schedule going.
    #[default]
    Continue,
    /// Surface `ExecutionFailed` and stall the workflow.
    FailWorkflow,
}

#[derive(Debug, Clone)]
pub struct RepeatOptions {
    /// Stride between ticks.
    pub every: Duration,
    /// First tick time; defaults to one stride after the task is created.
    pub start_at: Option<DateTime<Utc>>,
    /// Attempt budget per tick.
    pub max_attempts: i32,
    /// Ticks older than `scheduled_for + timeout` are skipped, not run.
    /// That is catch-up, not failure: after downtime the schedule
    /// fast-forwards to the present without firing stale ticks.
    pub timeout: Duration,
    pub on_error: RepeatOnError,
}

impl RepeatOptions {
    pub fn every(every: Duration) -> Self {
        Self {
            every,
            start_at: None,
            max_attempts: DEFAULT_STEP_ATTEMPTS,
            timeout: Duration::from_secs(60 * 60),
            on_error: RepeatOnError::default(),
        }
    }

    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn on_error(mut self, on_error: RepeatOnError) -> Self {
        self.on_error = on_error;
        self
    }
}

/// One entry of a workflow body: the handle user code drives.
///
/// Bounded by lock acquire and release; discarded when the entry ends.
pub struct Execution<'a> {
    store: &'a dyn Store,
    queue: &'a dyn JobQueue,
    workflow: Workflow,
    context: Context,
}

impl<'a> Execution<'a> {
    pub(crate) fn new(
        store: &'a dyn Store,
        queue: &'a dyn JobQueue,
        workflow: Workflow,
        context: Context,
    ) -> Self {
        Self {
            store,
            queue,
            workflow,
            context,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Invocation payload, as persisted on the workflow row.
    pub fn kwargs(&self) -> &Value {
        &self.workflow.kwargs
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub(crate) fn into_parts(self) -> (Workflow, Context) {
        (self.workflow, self.context)
    }

    /// Run `f` at most once successfully across all replays of this
    /// workflow, with the default per-step attempt budget.
    pub async fn durably_execute<F>(&mut self, name: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Context) -> Result<(), StepError>,
    {
        self.durably_execute_with(name, DEFAULT_STEP_ATTEMPTS, f).await
    }

    pub async fn durably_execute_with<F>(
        &mut self,
        name: &str,
        max_attempts: i32,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Context) -> Result<(), StepError>,
    {
        validate_step_name(name)?;
        let step_name = format!("durably_execute${name}");
        let step = self.load_step(&step_name, json!({})).await?;
        if step.state == StepState::Completed {
            return Ok(());
        }

        let attempts = self.begin_attempt(&step).await?;
        match f(&mut self.context) {
            Ok(()) => {
                self.complete_step(&step, None).await?;
                debug!(step = %step_name, "step completed");
                Ok(())
            }
            Err(err) => {
                self.track_step_error(&err).await;
                if attempts < max_attempts {
                    let delay = step_backoff(attempts);
                    warn!(
                        step = %step_name,
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        class = %err.class,
                        "step attempt failed; rescheduling"
                    );
                    self.reschedule(delay).await?;
                    Err(Error::Halt)
                } else {
                    self.fail_step(&step, &err).await?;
                    Err(Error::ExecutionFailed {
                        step: step_name,
                        class: err.class,
                        message: err.message,
                    })
                }
            }
        }
    }

    /// Durable sleep: completes once `duration` has elapsed since the step
    /// was first created; otherwise enqueues the remainder and halts.
    pub async fn wait(&mut self, name: &str, duration: Duration) -> Result<(), Error> {
        validate_step_name(name)?;
        let step_name = format!("wait${name}");
        let wake_at = Utc::now() + to_chrono(duration);
        let step = self
            .load_step(&step_name, json!({ "wait_until": rfc3339(wake_at) }))
            .await?;
        if step.state == StepState::Completed {
            return Ok(());
        }

        // The timestamp stamped at first creation is authoritative.
        let wake_at = metadata_time(&step.metadata, "wait_until").unwrap_or(wake_at);
        self.begin_attempt(&step).await?;

        let now = Utc::now();
        if now >= wake_at {
            self.complete_step(&step, None).await?;
            Ok(())
        } else {
            let remaining = (wake_at - now).to_std().unwrap_or_default();
            self.reschedule(remaining).await?;
            Err(Error::Halt)
        }
    }

    /// Poll `cond` until truthy, re-entering every `check_interval`, up to
    /// `timeout` past the first evaluation. Returns `true` on success and
    /// fails with [`Error::WaitConditionNotMet`] once the timeout passes.
    pub async fn wait_until<F>(
        &mut self,
        name: &str,
        options: WaitUntilOptions,
        cond: F,
    ) -> Result<bool, Error>
    where
        F: FnOnce(&mut Context) -> Result<bool, StepError>,
    {
        validate_step_name(name)?;
        let step_name = format!("wait_until${name}");
        let timeout_at = Utc::now() + to_chrono(options.timeout);
        let step = self
            .load_step(
                &step_name,
                json!({
                    "timeout_at": rfc3339(timeout_at),
                    "check_interval": options.check_interval.as_secs(),
                }),
            )
            .await?;
        if step.state == StepState::Completed {
            return Ok(true);
        }

        let timeout_at = metadata_time(&step.metadata, "timeout_at").unwrap_or(timeout_at);
        let check_interval = step
            .metadata
            .get("check_interval")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(options.check_interval);
        let attempts = self.begin_attempt(&step).await?;

        match cond(&mut self.context) {
            Ok(true) => {
                let metadata = merge_metadata(&step.metadata, "result", json!(true));
                self.complete_step(&step, Some(metadata)).await?;
                Ok(true)
            }
            Ok(false) => {
                if Utc::now() > timeout_at {
                    let err = StepError::new(
                        "WaitConditionNotMet",
                        format!("condition `{name}` still false at timeout"),
                    );
                    self.fail_step(&step, &err).await?;
                    Err(Error::WaitConditionNotMet { step: step_name })
                } else {
                    debug!(step = %step_name, "condition not met; polling again");
                    self.reschedule(check_interval).await?;
                    Err(Error::Halt)
                }
            }
            Err(err) => {
                if options.retry_on.contains(&err.class) {
                    warn!(
                        step = %step_name,
                        class = %err.class,
                        attempt = attempts,
                        "condition raised a retryable error; rescheduling"
                    );
                    self.reschedule(step_backoff(attempts)).await?;
                    Err(Error::Halt)
                } else {
                    self.track_step_error(&err).await;
                    self.fail_step(&step, &err).await?;
                    Err(Error::ExecutionFailed {
                        step: step_name,
                        class: err.class,
                        message: err.message,
                    })
                }
            }
        }
    }

    /// Event-driven wait: evaluate `cond` exactly once per entry. Falsy
    /// halts without rescheduling — the workflow stays idle until some
    /// external actor re-enqueues it.
    pub async fn continue_if<F>(&mut self, name: &str, cond: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Context) -> Result<bool, StepError>,
    {
        validate_step_name(name)?;
        let step_name = format!("continue_if${name}");
        let step = self.load_step(&step_name, json!({})).await?;
        if step.state == StepState::Completed {
            return Ok(());
        }

        self.begin_attempt(&step).await?;
        match cond(&mut self.context) {
            Ok(true) => {
                let metadata = merge_metadata(&step.metadata, "result", json!(true));
                self.complete_step(&step, Some(metadata)).await?;
                Ok(())
            }
            Ok(false) => {
                debug!(step = %step_name, "condition not met; waiting for external re-entry");
                Err(Error::Halt)
            }
            Err(err) => {
                self.track_step_error(&err).await;
                self.fail_step(&step, &err).await?;
                Err(Error::ExecutionFailed {
                    step: step_name,
                    class: err.class,
                    message: err.message,
                })
            }
        }
    }

    /// Run `tick` on a fixed stride until `till` reports done.
    ///
    /// A coordination log tracks the most recently fired tick; each planned
    /// tick gets its own log named by its unix timestamp. Ticks whose
    /// timeout has already passed are skipped and the schedule advances —
    /// that is how a long outage catches up to the present.
    pub async fn durably_repeat<T, F>(
        &mut self,
        name: &str,
        options: RepeatOptions,
        till: T,
        tick: F,
    ) -> Result<(), Error>
    where
        T: FnOnce(&Context) -> bool,
        F: FnOnce(&mut Context, DateTime<Utc>) -> Result<(), StepError>,
    {
        validate_step_name(name)?;
        let coordination_name = format!("durably_repeat${name}");
        let coordination = self.load_step(&coordination_name, json!({})).await?;
        if coordination.state == StepState::Completed {
            return Ok(());
        }

        if till(&self.context) {
            self.complete_step(&coordination, None).await?;
            debug!(step = %coordination_name, "repeating task finished");
            return Ok(());
        }

        let every = to_chrono(options.every);
        let next_at = match metadata_time(&coordination.metadata, "last_execution_at") {
            Some(last) => last + every,
            None => options.start_at.unwrap_or(coordination.created_at + every),
        };
        let timeout_at = next_at + to_chrono(options.timeout);

        let tick_name = format!("durably_repeat${name}${}", next_at.timestamp());
        let tick_step = self
            .load_step(
                &tick_name,
                json!({
                    "scheduled_for": rfc3339(next_at),
                    "timeout_at": rfc3339(timeout_at),
                    "parent_id": coordination.id,
                }),
            )
            .await?;

        // Crash window: the tick completed but the coordination log never
        // advanced. Re-entry lands here; advance without re-firing.
        if tick_step.state == StepState::Completed {
            self.advance_schedule(&coordination, next_at, every).await?;
            return Err(Error::Halt);
        }

        let now = Utc::now();
        if now < next_at {
            let remaining = (next_at - now).to_std().unwrap_or_default();
            self.reschedule(remaining).await?;
            return Err(Error::Halt);
        }

        if now > timeout_at {
            // Catch-up: the tick is stale, skip it without calling user
            // code. TimeoutError here is bookkeeping, not a user failure.
            let err = StepError::new("TimeoutError", "tick skipped during catch-up");
            self.fail_step(&tick_step, &err).await?;
            debug!(step = %tick_name, scheduled_for = %next_at, "skipping stale tick");
            self.advance_schedule(&coordination, next_at, every).await?;
            return Err(Error::Halt);
        }

        let attempts = self.begin_attempt(&tick_step).await?;
        match tick(&mut self.context, next_at) {
            Ok(()) => {
                self.complete_step(&tick_step, None).await?;
                self.advance_schedule(&coordination, next_at, every).await?;
                Err(Error::Halt)
            }
            Err(err) => {
                self.track_step_error(&err).await;
                if attempts < options.max_attempts {
                    warn!(
                        step = %tick_name,
                        attempt = attempts,
                        class = %err.class,
                        "tick attempt failed; rescheduling"
                    );
                    self.reschedule(step_backoff(attempts)).await?;
                    Err(Error::Halt)
                } else {
                    self.fail_step(&tick_step, &err).await?;
                    match options.on_error {
                        RepeatOnError::FailWorkflow => Err(Error::ExecutionFailed {
                            step: tick_name,
                            class: err.class,
                            message: err.message,
                        }),
                        RepeatOnError::Continue => {
                            warn!(
                                step = %tick_name,
                                class = %err.class,
                                "tick exhausted its attempts; skipping"
                            );
                            self.advance_schedule(&coordination, next_at, every).await?;
                            Err(Error::Halt)
                        }
                    }
                }
            }
        }
    }

    async fn load_step(&self, step_name: &str, metadata: Value) -> Result<ExecutionLog, Error> {
        Ok(self
            .store
            .find_or_create_step(
                self.workflow.id,
                step_name,
                NewStep {
                    metadata,
                    started_at: Some(Utc::now()),
                },
            )
            .await?)
    }

    /// Bump the attempt counter and stamp `last_executed_at`; returns the
    /// attempt number now in flight.
    async fn begin_attempt(&self, step: &ExecutionLog) -> Result<i32, Error> {
        let attempts = step.attempts + 1;
        self.store
            .update_step(
                step.id,
                StepPatch {
                    attempts: Some(attempts),
                    last_executed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(attempts)
    }

    async fn complete_step(
        &self,
        step: &ExecutionLog,
        metadata: Option<Value>,
    ) -> Result<(), Error> {
        self.store
            .update_step(
                step.id,
                StepPatch {
                    state: Some(StepState::Completed),
                    completed_at: Some(Utc::now()),
                    metadata,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn fail_step(&self, step: &ExecutionLog, err: &StepError) -> Result<(), Error> {
        self.store
            .update_step(
                step.id,
                StepPatch {
                    state: Some(StepState::Failed),
                    error_class: Some(err.class.clone()),
                    error_message: Some(err.message.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn advance_schedule(
        &self,
        coordination: &ExecutionLog,
        fired_at: DateTime<Utc>,
        every: chrono::Duration,
    ) -> Result<(), Error> {
        let metadata = merge_metadata(
            &coordination.metadata,
            "last_execution_at",
            json!(rfc3339(fired_at)),
        );
        self.store
            .update_step(
                coordination.id,
                StepPatch {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;
        let delay = (fired_at + every - Utc::now()).to_std().unwrap_or_default();
        self.reschedule(delay).await
    }

    /// Enqueue a re-entry for this workflow after `delay`.
    async fn reschedule(&self, delay: Duration) -> Result<(), Error> {
        self.queue
            .enqueue_after(delay, JobRequest::reentry(&self.workflow))
            .await?;
        Ok(())
    }

    async fn track_step_error(&self, err: &StepError) {
        let error = Error::User {
            class: err.class.clone(),
            message: err.message.clone(),
        };
        let _ = tracker::track(self.store, &self.workflow, &error, self.context.snapshot()).await;
    }
}

/// User-chosen names must not collide with the reserved `$`-delimited step
/// namespace.
fn validate_step_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains('$') {
        return Err(Error::InvalidStepName(name.to_string()));
    }
    Ok(())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn metadata_time(metadata: &Value, key: &str) -> Option<DateTime<Utc>> {
    metadata
        .get(key)?
        .as_str()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn merge_metadata(metadata: &Value, key: &str, value: Value) -> Value {
    let mut map = match metadata {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

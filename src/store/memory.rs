//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{RowLockFn, Store, StoreError, StoreResult};
use crate::error::Error;
use crate::model::{
    ErrorLog, ExecutionLog, NewErrorLog, NewStep, NewWorkflow, StepPatch, StepState, Workflow,
    WorkflowPatch, WorkflowState,
};

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    workflows: HashMap<i64, Workflow>,
    workflow_keys: HashMap<(String, String), i64>,
    steps: HashMap<i64, ExecutionLog>,
    step_keys: HashMap<(i64, String), i64>,
    errors: Vec<ErrorLog>,
}

impl MemoryInner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Stores all rows behind one mutex; holding it for the duration of
/// `with_row_lock` gives the same atomicity as the Postgres row lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_or_create_workflow(
        &self,
        job_class: &str,
        key: &str,
        init: NewWorkflow,
    ) -> StoreResult<Workflow> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let map_key = (job_class.to_string(), key.to_string());
        if let Some(id) = inner.workflow_keys.get(&map_key) {
            let id = *id;
            return Ok(inner.workflows[&id].clone());
        }
        let now = Utc::now();
        let id = inner.allocate_id();
        let workflow = Workflow {
            id,
            key: key.to_string(),
            job_class: job_class.to_string(),
            kwargs: init.kwargs,
            options: init.options,
            context: empty_object(),
            state: WorkflowState::Idle,
            locked_by: None,
            locked_at: None,
            started_at: init.started_at,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.workflow_keys.insert(map_key, id);
        inner.workflows.insert(id, workflow.clone());
        Ok(workflow)
    }

    async fn workflow_by_key(
        &self,
        job_class: &str,
        key: &str,
    ) -> StoreResult<Option<Workflow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let map_key = (job_class.to_string(), key.to_string());
        Ok(inner
            .workflow_keys
            .get(&map_key)
            .map(|id| inner.workflows[id].clone()))
    }

    async fn reload_workflow(&self, workflow_id: i64) -> StoreResult<Workflow> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn update_workflow(&self, workflow_id: i64, patch: WorkflowPatch) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        if let Some(state) = patch.state {
            workflow.state = state;
        }
        if let Some(context) = patch.context {
            workflow.context = context;
        }
        if let Some(completed_at) = patch.completed_at {
            workflow.completed_at = Some(completed_at);
        }
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn with_row_lock(&self, workflow_id: i64, f: RowLockFn) -> Result<Workflow, Error> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let stored = inner
            .workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let mut image = stored.clone();
        f(&mut image)?;
        image.updated_at = Utc::now();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.locked_by = image.locked_by.clone();
        workflow.locked_at = image.locked_at;
        workflow.state = image.state;
        workflow.updated_at = image.updated_at;
        Ok(workflow.clone())
    }

    async fn find_or_create_step(
        &self,
        workflow_id: i64,
        step_name: &str,
        init: NewStep,
    ) -> StoreResult<ExecutionLog> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        let map_key = (workflow_id, step_name.to_string());
        if let Some(id) = inner.step_keys.get(&map_key) {
            let id = *id;
            return Ok(inner.steps[&id].clone());
        }
        let now = Utc::now();
        let id = inner.allocate_id();
        let step = ExecutionLog {
            id,
            workflow_id,
            step_name: step_name.to_string(),
            attempts: 0,
            started_at: init.started_at,
            last_executed_at: None,
            completed_at: None,
            metadata: init.metadata,
            state: StepState::Pending,
            error_class: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.step_keys.insert(map_key, id);
        inner.steps.insert(id, step.clone());
        Ok(step)
    }

    async fn update_step(&self, step_id: i64, patch: StepPatch) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let step = inner
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        if let Some(state) = patch.state {
            step.state = state;
        }
        if let Some(attempts) = patch.attempts {
            step.attempts = attempts;
        }
        if let Some(last_executed_at) = patch.last_executed_at {
            step.last_executed_at = Some(last_executed_at);
        }
        if let Some(completed_at) = patch.completed_at {
            step.completed_at = Some(completed_at);
        }
        if let Some(metadata) = patch.metadata {
            step.metadata = metadata;
        }
        if let Some(error_class) = patch.error_class {
            step.error_class = Some(error_class);
        }
        if let Some(error_message) = patch.error_message {
            step.error_message = Some(error_message);
        }
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn steps_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ExecutionLog>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut steps: Vec<ExecutionLog> = inner
            .steps
            .values()
            .filter(|step| step.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.id);
        Ok(steps)
    }

    async fn insert_error_log(&self, error: NewErrorLog) -> StoreResult<ErrorLog> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let id = inner.allocate_id();
        let row = ErrorLog {
            id,
            workflow_id: error.workflow_id,
            error_class: error.error_class,
            error_message: error.error_message,
            backtrace: error.backtrace,
            context: error.context,
            created_at: now,
            updated_at: now,
        };
        inner.errors.push(row.clone());
        Ok(row)
    }

    async fn error_logs_for_workflow(&self, workflow_id: i64) -> StoreResult<Vec<ErrorLog>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .errors
            .iter()
            .filter(|row| row.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

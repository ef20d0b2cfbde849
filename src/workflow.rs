//! The user-facing workflow trait and the class registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::primitives::Execution;
use crate::retry::RetryPolicy;

/// A durable workflow body.
///
/// `perform` re-runs from the top on every entry; completed steps
/// short-circuit, so execution resumes at the first unfinished primitive.
/// The body must therefore be deterministic with respect to the context:
/// any value needed across entries belongs in the context, typically
/// written with `set_once`.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    /// Identifier persisted into `workflows.job_class`; must be stable
    /// across deploys.
    fn job_class(&self) -> &str;

    async fn perform(&self, exec: &mut Execution<'_>) -> Result<(), Error>;

    /// Whether an error escaping the body should be retried at
    /// `attempt_count`. The default allows three attempts.
    fn should_retry(&self, error: &Error, attempt_count: i32) -> bool {
        let _ = error;
        RetryPolicy::should_retry_default(attempt_count)
    }
}

/// Maps `job_class` strings to their handlers.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    handlers: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its `job_class`; the latest registration
    /// for a class wins.
    pub fn register(&mut self, handler: Arc<dyn WorkflowHandler>) {
        self.handlers
            .insert(handler.job_class().to_string(), handler);
    }

    pub fn get(&self, job_class: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers.get(job_class).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

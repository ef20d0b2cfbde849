//! Error-log recording. Never raises: a tracker failure must not mask the
//! error being tracked, so storage problems are logged and swallowed.

use std::backtrace::{Backtrace, BacktraceStatus};

use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::model::{ErrorLog, NewErrorLog, Workflow};
use crate::store::Store;

/// Insert an error-log row for `error`, with a snapshot of the workflow
/// context at failure time. Returns the created row, or `None` when the
/// tracker itself failed.
pub async fn track(
    store: &dyn Store,
    workflow: &Workflow,
    error: &Error,
    context_snapshot: Value,
) -> Option<ErrorLog> {
    let backtrace = Backtrace::capture();
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    };

    let row = NewErrorLog {
        workflow_id: workflow.id,
        error_class: Some(error.class()),
        error_message: Some(error.to_string()),
        backtrace,
        context: context_snapshot,
    };

    match store.insert_error_log(row).await {
        Ok(created) => Some(created),
        Err(err) => {
            warn!(
                workflow_id = workflow.id,
                key = %workflow.key,
                error = %err,
                "failed to record error log"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkflow;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn track_records_class_message_and_context() {
        let store = MemoryStore::new();
        let workflow = store
            .find_or_create_workflow("demo", "k1", NewWorkflow::default())
            .await
            .unwrap();

        let error = Error::User {
            class: "PaymentGlitch".to_string(),
            message: "card declined".to_string(),
        };
        let row = track(&store, &workflow, &error, json!({"amount": 5}))
            .await
            .expect("tracked");

        assert_eq!(row.workflow_id, workflow.id);
        assert_eq!(row.error_class.as_deref(), Some("PaymentGlitch"));
        assert_eq!(
            row.error_message.as_deref(),
            Some("PaymentGlitch: card declined")
        );
        assert_eq!(row.context, json!({"amount": 5}));

        let logs = store.error_logs_for_workflow(workflow.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }
}

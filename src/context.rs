//! Durable key/value state attached to a workflow.
//!
//! The context is the only legal place for state that must survive across
//! entries: the body re-runs from the top on every entry, so anything it
//! needs later has to live here (typically written with [`Context::set_once`]).
//! Values are JSON; writing goes through a serde round-trip so the stored
//! representation always equals the wire representation.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::store::Store;

/// Upper bound for a single string value, in bytes.
pub const MAX_STRING_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct Context {
    workflow_id: i64,
    values: Map<String, Value>,
    dirty: bool,
}

impl Context {
    /// Bind a context to a workflow row, starting from its persisted
    /// `context` column. Anything but a JSON object starts empty.
    pub fn new(workflow_id: i64, snapshot: Value) -> Self {
        let values = match snapshot {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            workflow_id,
            values,
            dirty: false,
        }
    }

    pub fn workflow_id(&self) -> i64 {
        self.workflow_id
    }

    /// Store a value under `key`, validating type and size.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), Error> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|err| Error::InvalidContextValue {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        validate_value(&key, &value)?;
        self.values.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    /// Store a value only when `key` is absent. Returns whether a write
    /// happened.
    pub fn set_once(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<bool, Error> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    /// Value under `key`, or `default` without writing it.
    pub fn fetch(&self, key: &str, default: impl Into<Value>) -> Value {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current state as a JSON object, e.g. for error-log snapshots.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Persist the whole blob back to the workflow row iff dirty.
    pub async fn save(&mut self, store: &dyn Store) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }
        store
            .update_workflow(
                self.workflow_id,
                crate::model::WorkflowPatch {
                    context: Some(self.snapshot()),
                    ..Default::default()
                },
            )
            .await?;
        self.dirty = false;
        Ok(())
    }
}

fn validate_value(key: &str, value: &Value) -> Result<(), Error> {
    match value {
        Value::String(text) if text.len() > MAX_STRING_BYTES => Err(Error::InvalidContextValue {
            key: key.to_string(),
            reason: format!("string exceeds {MAX_STRING_BYTES} bytes"),
        }),
        Value::Array(items) => {
            for item in items {
                validate_value(key, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                validate_value(key, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_accepts_every_json_type() {
        let mut ctx = Context::new(1, json!({}));
        ctx.set("string", "hello").unwrap();
        ctx.set("int", 42).unwrap();
        ctx.set("float", 1.5).unwrap();
        ctx.set("bool", true).unwrap();
        ctx.set("null", Value::Null).unwrap();
        ctx.set("object", json!({"a": 1})).unwrap();
        ctx.set("array", json!([1, 2, 3])).unwrap();

        assert_eq!(ctx.get("int"), Some(json!(42)));
        assert_eq!(ctx.get("object"), Some(json!({"a": 1})));
        assert!(ctx.is_dirty());
    }

    #[test]
    fn oversized_strings_are_rejected() {
        let mut ctx = Context::new(1, json!({}));
        let big = "x".repeat(MAX_STRING_BYTES + 1);
        let err = ctx.set("big", big).unwrap_err();
        assert!(matches!(err, Error::InvalidContextValue { .. }));
        assert!(!ctx.contains_key("big"));
    }

    #[test]
    fn oversized_strings_nested_in_objects_are_rejected() {
        let mut ctx = Context::new(1, json!({}));
        let big = "x".repeat(MAX_STRING_BYTES + 1);
        let err = ctx.set("nested", json!({"inner": [big]})).unwrap_err();
        assert!(matches!(err, Error::InvalidContextValue { .. }));
    }

    #[test]
    fn set_once_keeps_the_first_value() {
        let mut ctx = Context::new(1, json!({}));
        assert!(ctx.set_once("k", "first").unwrap());
        assert!(!ctx.set_once("k", "second").unwrap());
        assert!(!ctx.set_once("k", "third").unwrap());
        assert_eq!(ctx.get("k"), Some(json!("first")));
    }

    #[test]
    fn fetch_returns_default_without_writing() {
        let mut ctx = Context::new(1, json!({"present": 1}));
        assert_eq!(ctx.fetch("present", 0), json!(1));
        assert_eq!(ctx.fetch("absent", 7), json!(7));
        assert!(!ctx.contains_key("absent"));
        assert!(!ctx.is_dirty());
        ctx.set("touch", 1).unwrap();
        assert!(ctx.is_dirty());
    }

    #[test]
    fn non_object_snapshot_starts_empty() {
        let ctx = Context::new(1, Value::Null);
        assert_eq!(ctx.snapshot(), json!({}));
    }
}

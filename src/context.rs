use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{Result, TaskGroupError};

#[derive(Clone, Default)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    properties: RwLock<HashMap<String, Value>>,
    cancellation: CancellationToken,
}

impl InvocationContext {
    /// Keys of tasks that must not be invoked; they re-emit their cached
    /// result instead. Stored as a JSON array of strings.
    pub const KEY_SKIP_TASKS: &'static str = "SKIP_TASKS";

    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose token, once cancelled, stops tasks that have not
    /// started yet in every group invoked with it.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                properties: RwLock::new(HashMap::new()),
                cancellation: token,
            }),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .properties
            .write()
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.properties.read().get(key).cloned()
    }

    /// Deserializes the value stored under `key`.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| TaskGroupError::ContextValue {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner
            .properties
            .read()
            .get(key)
            .is_some_and(|v| !v.is_null())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.properties.write().remove(key)
    }

    pub(crate) fn skip_tasks(&self) -> Result<HashSet<String>> {
        Ok(self
            .get_as::<HashSet<String>>(Self::KEY_SKIP_TASKS)?
            .unwrap_or_default())
    }

    pub(crate) fn add_skip_task(&self, key: &str) {
        let mut properties = self.inner.properties.write();
        let entry = properties
            .entry(Self::KEY_SKIP_TASKS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(keys) = entry {
            if !keys.iter().any(|k| k.as_str() == Some(key)) {
                keys.push(Value::String(key.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("properties", &*self.inner.properties.read())
            .field("cancelled", &self.inner.cancellation.is_cancelled())
            .finish()
    }
}

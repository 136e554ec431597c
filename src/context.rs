//! [`ContextStore`] — the conversation-record collaborator the Scheduler
//! references by key only (§6.3). Opaque to the Scheduler: it never inspects
//! the value, only get-or-creates and deletes it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// An opaque reference to a conversation record, handed to the [`crate::agent::AgentRunner`]
/// as `context_ref` (§6.3). Wrapping a bare `String` rather than exposing the
/// record itself keeps `ContextStore`'s storage format free to change without
/// touching the Scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef(pub String);

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Returns the existing record for `key`, or creates an empty one.
    async fn get_or_create(&self, key: &str) -> ContextRef;

    async fn get(&self, key: &str) -> Option<ContextRef>;

    async fn put(&self, key: &str, value: ContextRef);

    /// Removes the record for `key`. Called in the same critical section as
    /// `TaskStore::remove` when a task is deleted (§3 Lifecycle).
    async fn delete(&self, key: &str);
}

/// An in-process [`ContextStore`] backed by a plain map. Sufficient for a
/// single-node deployment; swap in a file- or database-backed implementation
/// behind the same trait for multi-node setups.
#[derive(Default)]
pub struct InMemoryContextStore {
    records: Mutex<HashMap<String, ContextRef>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get_or_create(&self, key: &str) -> ContextRef {
        let mut guard = self.records.lock().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| ContextRef(key.to_string()))
            .clone()
    }

    async fn get(&self, key: &str) -> Option<ContextRef> {
        self.records.lock().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: ContextRef) {
        self.records.lock().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.records.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = InMemoryContextStore::new();
        let a = store.get_or_create("task-1").await;
        let b = store.get_or_create("task-1").await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let store = InMemoryContextStore::new();
        store.get_or_create("task-1").await;
        store.delete("task-1").await;
        assert_eq!(store.get("task-1").await, None);
    }
}

//! Per-session conversation state.

use chrono::{DateTime, Utc};
use dh_types::ChatTurn;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// History for one context id. Access time is tracked by the
/// [`ContextManager`] that owns it.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    id: String,
    messages: Vec<ChatTurn>,
    created_at: DateTime<Utc>,
    /// Structured context handed to agent runs.
    pub agent_context: Map<String, Value>,
}

impl ConversationContext {
    fn new(id: String) -> Self {
        Self {
            id,
            messages: Vec::new(),
            created_at: Utc::now(),
            agent_context: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Turns in insertion order.
    pub fn messages(&self) -> &[ChatTurn] {
        &self.messages
    }

    /// Appends a turn. History is never rewritten.
    pub fn append(&mut self, turn: ChatTurn) {
        self.messages.push(turn);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn snapshot(&self, last_access: DateTime<Utc>) -> ContextSnapshot {
        ContextSnapshot {
            context_id: self.id.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
            last_access,
        }
    }
}

/// Serializable copy of a context, as exposed over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub context_id: String,
    pub messages: Vec<ChatTurn>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Shared handle to one context. Hold the lock for a whole turn.
pub type ContextHandle = Arc<Mutex<ConversationContext>>;

struct Entry {
    handle: ContextHandle,
    last_access: DateTime<Utc>,
}

/// Owns every conversation context.
///
/// The map lock is held only to look up, insert or remove entries; the
/// per-context mutex serializes work on one id without blocking others.
pub struct ContextManager {
    contexts: RwLock<HashMap<String, Entry>>,
    max_contexts: Option<usize>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ContextManager {
    /// `max_contexts` bounds memory by evicting the least recently
    /// accessed idle context when exceeded.
    pub fn new(max_contexts: Option<usize>) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            max_contexts: max_contexts.filter(|m| *m > 0),
        }
    }

    /// Returns the context for `id`, creating it on first reference. A
    /// fresh UUID is assigned when `id` is `None` or blank.
    pub async fn get_context(&self, id: Option<&str>) -> (String, ContextHandle) {
        let id = match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let now = Utc::now();

        let mut contexts = self.contexts.write().await;
        if let Some(entry) = contexts.get_mut(&id) {
            entry.last_access = now;
            return (id, entry.handle.clone());
        }

        let handle = Arc::new(Mutex::new(ConversationContext::new(id.clone())));
        contexts.insert(
            id.clone(),
            Entry {
                handle: handle.clone(),
                last_access: now,
            },
        );
        tracing::debug!(context_id = %id, "created conversation context");

        if let Some(max) = self.max_contexts {
            while contexts.len() > max {
                let victim = contexts
                    .iter()
                    .filter(|(key, entry)| *key != &id && entry.handle.try_lock().is_ok())
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(key, _)| key.clone());
                match victim {
                    Some(key) => {
                        contexts.remove(&key);
                        tracing::debug!(context_id = %key, "evicted least recently used context");
                    }
                    None => break,
                }
            }
        }
        (id, handle)
    }

    /// Looks up an existing context without creating one.
    pub async fn get(&self, id: &str) -> Option<ContextHandle> {
        let mut contexts = self.contexts.write().await;
        let entry = contexts.get_mut(id)?;
        entry.last_access = Utc::now();
        Some(entry.handle.clone())
    }

    /// Appends `turn` to the history of `id`, creating the context if
    /// needed.
    pub async fn update_context(&self, id: &str, turn: ChatTurn) {
        let (_, handle) = self.get_context(Some(id)).await;
        handle.lock().await.append(turn);
    }

    /// Reading a snapshot counts as an access.
    pub async fn snapshot(&self, id: &str) -> Option<ContextSnapshot> {
        let (handle, last_access) = {
            let mut contexts = self.contexts.write().await;
            let entry = contexts.get_mut(id)?;
            entry.last_access = Utc::now();
            (entry.handle.clone(), entry.last_access)
        };
        let context = handle.lock().await;
        Some(context.snapshot(last_access))
    }

    /// When `id` was last looked up, if it exists.
    pub async fn last_access(&self, id: &str) -> Option<DateTime<Utc>> {
        self.contexts.read().await.get(id).map(|entry| entry.last_access)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.contexts.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }

    /// Removes contexts not accessed within `max_age`. Contexts that are
    /// locked by an in-flight turn are kept. Returns the number removed.
    pub async fn clear_old_contexts(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now() - max_age;

        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|id, entry| {
            let stale = entry.last_access < cutoff;
            if stale && entry.handle.try_lock().is_err() {
                tracing::debug!(context_id = %id, "keeping stale context that is in use");
                return true;
            }
            !stale
        });
        let removed = before - contexts.len();
        if removed > 0 {
            tracing::info!(removed, remaining = contexts.len(), "cleared stale contexts");
        }
        removed
    }
}

/// Shallow-merges `extra` over `stored`; keys in `extra` win.
pub fn merge_agent_context(stored: &Map<String, Value>, extra: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = stored.clone();
    for (key, value) in extra {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_prefers_caller_keys() {
        let stored = json!({"name": "Ada", "lang": "zh"}).as_object().unwrap().clone();
        let extra = json!({"lang": "en", "topic": "rust"}).as_object().unwrap().clone();
        let merged = merge_agent_context(&stored, &extra);
        assert_eq!(
            Value::Object(merged),
            json!({"name": "Ada", "lang": "en", "topic": "rust"})
        );
    }
}

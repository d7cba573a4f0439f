//! Path-addressed session-store port.
//!
//! The production deployment backs this trait with the hosted realtime
//! database; everything in the client core talks to the [`SessionStore`]
//! trait so the whole session flow can run against the in-memory
//! [`LocalSessionStore`] in tests and local harnesses.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

/// Delivered to subscribers whenever the value at or below their watched
/// path changes. `value` is the current snapshot of the watched path itself,
/// `None` when the subtree no longer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub path: String,
    pub value: Option<Value>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection closed")]
    Closed,
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("merge payload for {path} must be an object")]
    InvalidPatch { path: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Remote key-value tree with push/listen semantics.
///
/// `merge_update` is a shallow field merge at the path: top-level keys of
/// the patch land individually and sibling keys survive. `replace` clobbers
/// the whole subtree. Concurrent writers to one record must use
/// `merge_update` only.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn read_once(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Fires on any value change at or below `path`. Dropping the receiver
    /// detaches the subscription.
    fn subscribe(&self, path: &str) -> broadcast::Receiver<StoreEvent>;

    async fn merge_update(&self, path: &str, patch: Value) -> StoreResult<()>;

    async fn replace(&self, path: &str, value: Value) -> StoreResult<()>;

    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Registers a server-side fallback merge applied when this client's
    /// connection drops, without client cooperation.
    async fn on_disconnect_merge(&self, path: &str, patch: Value) -> StoreResult<()>;
}

/// In-memory store for tests and local harnesses.
#[derive(Debug, Default)]
pub struct LocalSessionStore {
    tree: parking_lot::RwLock<Value>,
    watchers: parking_lot::RwLock<HashMap<String, broadcast::Sender<StoreEvent>>>,
    disconnect_hooks: parking_lot::Mutex<Vec<(String, Value)>>,
}

impl LocalSessionStore {
    pub fn new() -> Self {
        Self {
            tree: parking_lot::RwLock::new(Value::Object(Map::new())),
            watchers: parking_lot::RwLock::new(HashMap::new()),
            disconnect_hooks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Applies every registered disconnect hook, as the backend would when
    /// the client's connection drops.
    pub fn simulate_disconnect(&self) {
        let hooks: Vec<(String, Value)> = self.disconnect_hooks.lock().drain(..).collect();
        for (path, patch) in hooks {
            if let Err(err) = self.merge_now(&path, patch) {
                // Hooks are fire-and-forget on the real backend too.
                let _ = err;
            }
        }
    }

    fn sender_for(&self, path: &str) -> broadcast::Sender<StoreEvent> {
        let normalized = normalize(path);
        let mut guard = self.watchers.write();
        guard
            .entry(normalized)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn merge_now(&self, path: &str, patch: Value) -> StoreResult<()> {
        let fields = match patch {
            Value::Object(fields) => fields,
            _ => {
                return Err(StoreError::InvalidPatch {
                    path: normalize(path),
                })
            }
        };
        {
            let mut tree = self.tree.write();
            let target = ensure_object(&mut tree, &segments(path));
            for (key, value) in fields {
                if value.is_null() {
                    target.remove(&key);
                } else {
                    target.insert(key, value);
                }
            }
        }
        self.notify(path);
        Ok(())
    }

    fn write_now(&self, path: &str, value: Option<Value>) {
        {
            let mut tree = self.tree.write();
            set_at(&mut tree, &segments(path), value);
        }
        self.notify(path);
    }

    fn notify(&self, changed: &str) {
        let changed_segments = segments(changed);
        let watchers = self.watchers.read();
        for (watched, sender) in watchers.iter() {
            if sender.receiver_count() == 0 {
                continue;
            }
            let watched_segments = segments(watched);
            if !overlaps(&watched_segments, &changed_segments) {
                continue;
            }
            let value = {
                let tree = self.tree.read();
                get_at(&tree, &watched_segments).cloned()
            };
            let _ = sender.send(StoreEvent {
                path: watched.clone(),
                value,
            });
        }
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn read_once(&self, path: &str) -> StoreResult<Option<Value>> {
        let tree = self.tree.read();
        Ok(get_at(&tree, &segments(path)).cloned())
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<StoreEvent> {
        self.sender_for(path).subscribe()
    }

    async fn merge_update(&self, path: &str, patch: Value) -> StoreResult<()> {
        self.merge_now(path, patch)
    }

    async fn replace(&self, path: &str, value: Value) -> StoreResult<()> {
        if value.is_null() {
            self.write_now(path, None);
        } else {
            self.write_now(path, Some(value));
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.write_now(path, None);
        Ok(())
    }

    async fn on_disconnect_merge(&self, path: &str, patch: Value) -> StoreResult<()> {
        if !patch.is_object() {
            return Err(StoreError::InvalidPatch {
                path: normalize(path),
            });
        }
        self.disconnect_hooks.lock().push((normalize(path), patch));
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    segments(path).join("/")
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_owned())
        .collect()
}

/// A write at `changed` is visible to a watcher at `watched` when either
/// path is an ancestor of (or equal to) the other.
fn overlaps(watched: &[String], changed: &[String]) -> bool {
    let shorter = watched.len().min(changed.len());
    watched[..shorter] == changed[..shorter]
}

fn get_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn ensure_object<'a>(root: &'a mut Value, path: &[String]) -> &'a mut Map<String, Value> {
    let mut current = root;
    for segment in path {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current.as_object_mut().expect("object ensured above")
}

fn set_at(root: &mut Value, path: &[String], value: Option<Value>) {
    if path.is_empty() {
        *root = value.unwrap_or(Value::Object(Map::new()));
        return;
    }
    let (leaf, parents) = path.split_last().expect("non-empty path");
    let parent = ensure_object(root, parents);
    match value {
        Some(value) => {
            parent.insert(leaf.clone(), value);
        }
        None => {
            parent.remove(leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merge_preserves_sibling_fields() {
        let store = LocalSessionStore::new();
        let path = "polls/p1/students/abc";
        store
            .merge_update(path, json!({ "status": "SUBMITTED" }))
            .await
            .expect("first writer");
        store
            .merge_update(path, json!({ "lastViolationReason": "exit-fullscreen" }))
            .await
            .expect("second writer");

        let record = store.read_once(path).await.expect("read").expect("present");
        assert_eq!(record["status"], "SUBMITTED");
        assert_eq!(record["lastViolationReason"], "exit-fullscreen");
    }

    #[tokio::test]
    async fn merge_with_null_removes_field() {
        let store = LocalSessionStore::new();
        store
            .merge_update("a/b", json!({ "x": 1, "y": 2 }))
            .await
            .expect("seed");
        store
            .merge_update("a/b", json!({ "x": null }))
            .await
            .expect("delete");
        let value = store.read_once("a/b").await.expect("read").expect("present");
        assert!(value.get("x").is_none());
        assert_eq!(value["y"], 2);
    }

    #[tokio::test]
    async fn replace_clobbers_the_subtree() {
        let store = LocalSessionStore::new();
        store
            .merge_update("sessions/p1", json!({ "status": "OPEN", "questionIndex": 3 }))
            .await
            .expect("seed");
        store
            .replace("sessions/p1", json!({ "status": "ENDED" }))
            .await
            .expect("replace");
        let value = store
            .read_once("sessions/p1")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(value["status"], "ENDED");
        assert!(value.get("questionIndex").is_none());
    }

    #[tokio::test]
    async fn subscriber_sees_descendant_writes() {
        let store = LocalSessionStore::new();
        let mut events = store.subscribe("polls/p1");
        store
            .merge_update("polls/p1/students/abc", json!({ "status": "ACTIVE" }))
            .await
            .expect("write");
        let event = events.recv().await.expect("event");
        assert_eq!(event.path, "polls/p1");
        let value = event.value.expect("subtree present");
        assert_eq!(value["students"]["abc"]["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn subscriber_sees_ancestor_replace() {
        let store = LocalSessionStore::new();
        let mut events = store.subscribe("sessions/p1/status");
        store
            .replace("sessions/p1", json!({ "status": "OPEN" }))
            .await
            .expect("replace");
        let event = events.recv().await.expect("event");
        assert_eq!(event.value, Some(json!("OPEN")));

        store.remove("sessions/p1").await.expect("remove");
        let event = events.recv().await.expect("event");
        assert_eq!(event.value, None);
    }

    #[tokio::test]
    async fn unrelated_paths_do_not_fire() {
        let store = LocalSessionStore::new();
        let mut events = store.subscribe("sessions/p1");
        store
            .replace("sessions/p2", json!({ "status": "OPEN" }))
            .await
            .expect("replace");
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn disconnect_hook_applies_registered_merge() {
        let store = LocalSessionStore::new();
        let path = "polls/p1/students/abc";
        store
            .merge_update(path, json!({ "status": "ACTIVE", "name": "Jane" }))
            .await
            .expect("seed");
        store
            .on_disconnect_merge(path, json!({ "status": "DISCONNECTED" }))
            .await
            .expect("hook");

        store.simulate_disconnect();

        let record = store.read_once(path).await.expect("read").expect("present");
        assert_eq!(record["status"], "DISCONNECTED");
        assert_eq!(record["name"], "Jane");
    }

    #[tokio::test]
    async fn read_once_missing_path_is_none() {
        let store = LocalSessionStore::new();
        assert!(store
            .read_once("nowhere/at/all")
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn merge_rejects_non_object_payload() {
        let store = LocalSessionStore::new();
        let err = store
            .merge_update("a/b", json!("scalar"))
            .await
            .expect_err("must reject");
        assert!(matches!(err, StoreError::InvalidPatch { .. }));
    }
}

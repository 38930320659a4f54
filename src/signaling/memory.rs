use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ChangeCallback, SignalingStore, Subscription};
use crate::errors::SignalingError;
use crate::utils::random_id;

/// In-process signaling store.
///
/// A tree of JSON values addressed by `/`-separated paths. Watchers fire with
/// the value at their path whenever a write touches it, an ancestor or a
/// descendant, and only when that value actually changed. Callbacks run on
/// the writer's task and must not call back into the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
    // serialises mutation + notification so watchers see changes in order
    dispatch: Arc<Mutex<()>>,
}

#[derive(Default)]
struct StoreState {
    root: Map<String, Value>,
    watchers: BTreeMap<u64, Watcher>,
    next_watcher: u64,
    next_key: u64,
    offline: bool,
}

struct Watcher {
    segments: Vec<String>,
    last: Option<Value>,
    callback: ChangeCallback,
}

type Pending = Vec<(ChangeCallback, Option<Value>)>;

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn lookup<'a>(root: &'a Map<String, Value>, segs: &[String]) -> Option<&'a Value> {
    let (first, rest) = segs.split_first()?;
    let mut node = root.get(first)?;
    for seg in rest {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

fn value_at(root: &Map<String, Value>, segs: &[String]) -> Option<Value> {
    if segs.is_empty() {
        return (!root.is_empty()).then(|| Value::Object(root.clone()));
    }
    lookup(root, segs).cloned()
}

fn insert(root: &mut Map<String, Value>, segs: &[String], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        return;
    };
    let mut node = root;
    for seg in parents {
        let child = node
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        let Value::Object(map) = child else {
            return;
        };
        node = map;
    }
    node.insert(last.clone(), value);
}

/// Removes the node and prunes parents left empty.
fn delete(root: &mut Map<String, Value>, segs: &[String]) {
    let Some((first, rest)) = segs.split_first() else {
        root.clear();
        return;
    };
    if rest.is_empty() {
        root.remove(first);
        return;
    }
    if let Some(Value::Object(child)) = root.get_mut(first) {
        delete(child, rest);
        if child.is_empty() {
            root.remove(first);
        }
    }
}

fn store_value(root: &mut Map<String, Value>, segs: &[String], value: Value) {
    if value.is_null() {
        delete(root, segs);
    } else if segs.is_empty() {
        if let Value::Object(map) = value {
            *root = map;
        }
    } else {
        insert(root, segs, value);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail, to exercise outage handling.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Synchronous read for assertions and diagnostics.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        value_at(&self.state().root, &segments(path))
    }

    pub fn watcher_count(&self) -> usize {
        self.state().watchers.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(state: &StoreState) -> Result<(), SignalingError> {
        if state.offline {
            Err(SignalingError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn changed(state: &mut StoreState, touched: &[String]) -> Pending {
        let StoreState { root, watchers, .. } = state;
        let mut pending = Vec::new();
        for watcher in watchers.values_mut() {
            if !related(&watcher.segments, touched) {
                continue;
            }
            let now = value_at(root, &watcher.segments);
            if now != watcher.last {
                watcher.last = now.clone();
                pending.push((watcher.callback.clone(), now));
            }
        }
        pending
    }

    fn mutate(
        &self,
        path: &str,
        apply: impl FnOnce(&mut StoreState, &[String]),
    ) -> Result<(), SignalingError> {
        let _order = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        let segs = segments(path);
        let pending = {
            let mut state = self.state();
            Self::check_online(&state)?;
            apply(&mut state, &segs);
            Self::changed(&mut state, &segs)
        };
        for (callback, value) in pending {
            callback(value);
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn read_once(&self, path: &str) -> Result<Option<Value>, SignalingError> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(value_at(&state.root, &segments(path)))
    }

    async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<Subscription, SignalingError> {
        let _order = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        let segs = segments(path);
        let (id, current) = {
            let mut state = self.state();
            Self::check_online(&state)?;
            let current = value_at(&state.root, &segs);
            let id = state.next_watcher;
            state.next_watcher += 1;
            state.watchers.insert(
                id,
                Watcher {
                    segments: segs,
                    last: current.clone(),
                    callback: on_change.clone(),
                },
            );
            (id, current)
        };
        on_change(current);

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(path, move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .watchers
                    .remove(&id);
            }
        }))
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), SignalingError> {
        self.mutate(path, |state, segs| store_value(&mut state.root, segs, value))
    }

    async fn update_fields(
        &self,
        path: &str,
        fields: Map<String, Value>,
    ) -> Result<(), SignalingError> {
        self.mutate(path, |state, segs| {
            for (field, value) in fields {
                let mut full = segs.to_vec();
                full.extend(segments(&field));
                store_value(&mut state.root, &full, value);
            }
        })
    }

    async fn append(&self, path: &str, value: Value) -> Result<String, SignalingError> {
        let mut key = String::new();
        self.mutate(path, |state, segs| {
            // zero padded so keys sort in append order
            key = format!("k{:012}{}", state.next_key, &random_id()[..6]);
            state.next_key += 1;
            let mut full = segs.to_vec();
            full.push(key.clone());
            store_value(&mut state.root, &full, value);
        })?;
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<(), SignalingError> {
        self.mutate(path, |state, segs| delete(&mut state.root, segs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<Option<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Arc::new(move |v| sink.lock().unwrap().push(v));
        (callback, seen)
    }

    #[tokio::test]
    async fn subscribe_fires_immediately_then_on_change() {
        let store = MemoryStore::new();
        store.write("calls/c1/status", json!("pending")).await.unwrap();

        let (cb, seen) = recorder();
        let _sub = store.subscribe("calls/c1/status", cb).await.unwrap();
        store.write("calls/c1/status", json!("accepted")).await.unwrap();
        // unrelated sibling write does not re-fire
        store.write("calls/c1/offer", json!({"type": "offer", "sdp": "x"})).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(json!("pending")), Some(json!("accepted"))]
        );
    }

    #[tokio::test]
    async fn removal_delivers_absent_and_prunes() {
        let store = MemoryStore::new();
        store.write("calls/c1/status", json!("ended")).await.unwrap();
        let (cb, seen) = recorder();
        let _sub = store.subscribe("calls/c1/status", cb).await.unwrap();

        store.remove("calls/c1").await.unwrap();

        assert_eq!(seen.lock().unwrap().last().cloned(), Some(None));
        assert_eq!(store.snapshot("calls"), None);
    }

    #[tokio::test]
    async fn update_fields_patches_without_clobbering_children() {
        let store = MemoryStore::new();
        store
            .append("calls/c1/candidates/a", json!({"candidate": "c0"}))
            .await
            .unwrap();
        let mut fields = Map::new();
        fields.insert("status".into(), json!("pending"));
        fields.insert("offer".into(), json!({"type": "offer", "sdp": "x"}));
        store.update_fields("calls/c1", fields).await.unwrap();

        let node = store.snapshot("calls/c1").unwrap();
        assert_eq!(node["status"], json!("pending"));
        assert_eq!(node["candidates"]["a"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn appended_keys_sort_in_append_order() {
        let store = MemoryStore::new();
        let mut keys = Vec::new();
        for i in 0..12 {
            keys.push(store.append("list", json!(i)).await.unwrap());
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let list = store.snapshot("list").unwrap();
        let values: Vec<i64> = list
            .as_object()
            .unwrap()
            .values()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(values, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn ancestor_watcher_sees_descendant_writes() {
        let store = MemoryStore::new();
        let (cb, seen) = recorder();
        let _sub = store.subscribe("calls/c1/candidates/b", cb).await.unwrap();
        store
            .append("calls/c1/candidates/b", json!({"candidate": "x"}))
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_ref().unwrap().as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_firing() {
        let store = MemoryStore::new();
        let (cb, seen) = recorder();
        let sub = store.subscribe("x", cb).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        sub.cancel();
        assert_eq!(store.watcher_count(), 0);
        store.write("x", json!(1)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let store = MemoryStore::new();
        let (cb, _seen) = recorder();
        {
            let _sub = store.subscribe("x", cb).await.unwrap();
            assert_eq!(store.watcher_count(), 1);
        }
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn offline_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.read_once("x").await.is_err());
        assert!(store.write("x", json!(1)).await.is_err());
        assert!(store.append("x", json!(1)).await.is_err());
        assert!(store.remove("x").await.is_err());
        let (cb, _) = recorder();
        assert!(store.subscribe("x", cb).await.is_err());
        store.set_offline(false);
        assert!(store.write("x", json!(1)).await.is_ok());
    }
}

//! In-process [`SignalingStore`] for tests and single-host sessions.
//!
//! One JSON tree behind a lock. Watchers are re-evaluated after each
//! mutation and only hear about values that actually changed.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::signaling::{SignalingStore, Subscription};

struct ValueWatcher {
    path: Vec<String>,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    path: Vec<String>,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<(String, Value)>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
    push_seq: u64,
    offline: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection to the backend: every read and write
    /// fails with [`StoreError::Unavailable`] until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    fn check_online(inner: &Inner) -> Result<()> {
        if inner.offline {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

fn split(path: &str) -> Result<Vec<String>> {
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if segs.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// Nulls are never stored; empty objects vanish with them.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

fn get_at<'a>(node: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter().try_fold(node, |node, seg| node.get(seg.as_str()))
}

fn set_at(node: &mut Value, segs: &[String], value: Option<Value>) {
    let Some((head, rest)) = segs.split_first() else {
        return;
    };
    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    if rest.is_empty() {
        match value {
            Some(v) => {
                map.insert(head.clone(), v);
            }
            None => {
                map.remove(head);
            }
        }
        return;
    }

    if value.is_none() && !map.contains_key(head) {
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    set_at(child, rest, value);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(head);
    }
}

impl Inner {
    fn apply(&mut self, segs: &[String], value: Option<Value>) {
        let value = value.and_then(normalize);
        set_at(&mut self.root, segs, value);
    }

    fn notify(&mut self) {
        let root = &self.root;

        self.watchers.retain_mut(|w| {
            let current = get_at(root, &w.path).cloned();
            if current == w.last {
                return !w.tx.is_closed();
            }
            w.last = current.clone();
            w.tx.send(current).is_ok()
        });

        self.child_watchers.retain_mut(|w| {
            let children = get_at(root, &w.path).and_then(Value::as_object);
            let Some(children) = children else {
                w.seen.clear();
                return !w.tx.is_closed();
            };
            w.seen.retain(|k| children.contains_key(k));
            for (key, value) in children {
                if w.seen.insert(key.clone()) && w.tx.send((key.clone(), value.clone())).is_err() {
                    return false;
                }
            }
            true
        });
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let segs = split(path)?;
        let inner = self.inner.lock();
        Self::check_online(&inner)?;
        Ok(get_at(&inner.root, &segs).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        let segs = split(path)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        trace!(path, "write");
        inner.apply(&segs, Some(value));
        inner.notify();
        Ok(())
    }

    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<()> {
        let writes = writes
            .into_iter()
            .map(|(path, value)| split(&path).map(|segs| (segs, value)))
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        debug!(paths = writes.len(), "multi-path update");
        for (segs, value) in writes {
            inner.apply(&segs, value);
        }
        inner.notify();
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let segs = split(path)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        trace!(path, "remove");
        inner.apply(&segs, None);
        inner.notify();
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let mut segs = split(path)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        inner.push_seq += 1;
        let key = format!("{:020}", inner.push_seq);
        segs.push(key.clone());
        inner.apply(&segs, Some(value));
        inner.notify();
        Ok(key)
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        new: Option<Value>,
    ) -> Result<bool> {
        let segs = split(path)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;

        let current = get_at(&inner.root, &segs);
        let expected = expected.and_then(normalize);
        if current != expected.as_ref() {
            trace!(path, "compare-and-set lost");
            return Ok(false);
        }
        inner.apply(&segs, new);
        inner.notify();
        Ok(true)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription<Option<Value>>> {
        let segs = split(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let current = get_at(&inner.root, &segs).cloned();
        // receiver is alive, the send cannot fail
        let _ = tx.send(current.clone());
        inner.watchers.push(ValueWatcher {
            path: segs,
            last: current,
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn subscribe_children(&self, path: &str) -> Result<Subscription<(String, Value)>> {
        let segs = split(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let mut seen = HashSet::new();
        if let Some(children) = get_at(&inner.root, &segs).and_then(Value::as_object) {
            for (key, value) in children {
                seen.insert(key.clone());
                let _ = tx.send((key.clone(), value.clone()));
            }
        }
        inner.child_watchers.push(ChildWatcher {
            path: segs,
            seen,
            tx,
        });
        Ok(Subscription::new(rx))
    }
}

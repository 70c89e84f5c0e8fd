//! Realtime key/value store used as the rendezvous channel for calls.
//!
//! Paths are `/`-separated keys into one JSON tree (`calls/{id}/status`).
//! Writing `null` or calling [`SignalingStore::remove`] deletes the subtree.
//! There is no ordering guarantee between independent paths, only
//! [`SignalingStore::update`] and [`SignalingStore::compare_and_set`] are
//! atomic.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Live feed of changes for one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the store side is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Apply every `(path, value)` pair atomically; `None` deletes.
    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Append under `path` with a fresh, lexically increasing key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Replace the value at `path` only if it currently equals `expected`.
    /// Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        new: Option<Value>,
    ) -> Result<bool>;

    /// Current value first, then every change (including deletion as `None`).
    async fn subscribe(&self, path: &str) -> Result<Subscription<Option<Value>>>;

    /// Existing children in key order first, then each newly added child.
    async fn subscribe_children(&self, path: &str) -> Result<Subscription<(String, Value)>>;
}

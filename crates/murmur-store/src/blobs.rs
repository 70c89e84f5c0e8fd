use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Remote object storage for encrypted attachments (put/get by path).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Fails with [`StoreError::NotFound`] for unknown paths.
    async fn get(&self, path: &str) -> Result<Bytes>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    gets: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        if path.is_empty() || path.contains("..") {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        debug!(path, size = data.len(), "stored blob");
        self.blobs.write().insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.blobs.read().get(path).cloned().ok_or(StoreError::NotFound)
    }
}

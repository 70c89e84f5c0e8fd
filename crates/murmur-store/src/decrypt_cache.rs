//! Decrypt-once cache for encrypted attachments.
//!
//! At most one fetch-and-decrypt runs per message id. Concurrent requests
//! share the pending future; the result is kept as an [`ObjectHandle`] until
//! it is invalidated, cleared or evicted by the capacity bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use murmur_shared::envelope::KeyHeader;
use murmur_shared::UserId;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blobs::BlobStore;
use crate::e2e::MessageCrypto;
use crate::error::E2eError;

pub const DEFAULT_CAPACITY: usize = 256;

/// Locally scoped plaintext object, addressed by a `blob:` url.
#[derive(Debug)]
pub struct ObjectHandle {
    url: String,
    data: Bytes,
    revoked: AtomicBool,
}

impl ObjectHandle {
    fn new(data: Bytes) -> Self {
        Self {
            url: format!("blob:{}", Uuid::new_v4()),
            data,
            revoked: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Plaintext, until the handle is revoked.
    pub fn data(&self) -> Option<&Bytes> {
        (!self.is_revoked()).then_some(&self.data)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

/// Reference to an encrypted attachment.
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    pub message_id: String,
    /// Blob store path of the ciphertext.
    pub path: String,
    pub sender: UserId,
    pub header: KeyHeader,
}

pub type DecryptResult = Result<Arc<ObjectHandle>, Arc<E2eError>>;

type PendingDecrypt = Shared<BoxFuture<'static, DecryptResult>>;

enum Entry {
    Pending { generation: u64, fut: PendingDecrypt },
    Ready { handle: Arc<ObjectHandle>, last_used: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub fetches: u64,
    pub hits: u64,
}

pub struct DecryptCache {
    crypto: Arc<MessageCrypto>,
    blobs: Arc<dyn BlobStore>,
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
    clock: AtomicU64,
    fetches: Arc<AtomicU64>,
    hits: AtomicU64,
}

impl DecryptCache {
    pub fn new(crypto: Arc<MessageCrypto>, blobs: Arc<dyn BlobStore>) -> Self {
        Self::with_capacity(crypto, blobs, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(crypto: Arc<MessageCrypto>, blobs: Arc<dyn BlobStore>, capacity: usize) -> Self {
        Self {
            crypto,
            blobs,
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            fetches: Arc::new(AtomicU64::new(0)),
            hits: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fetches: self.fetches.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
        }
    }

    /// Fetch and decrypt `file`, or join the decryption already in flight.
    pub async fn get(&self, file: &EncryptedFile) -> DecryptResult {
        let (generation, fut) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&file.message_id) {
                Some(Entry::Ready { handle, last_used }) => {
                    *last_used = self.tick();
                    self.hits.fetch_add(1, Ordering::SeqCst);
                    return Ok(handle.clone());
                }
                Some(Entry::Pending { generation, fut }) => {
                    debug!(message_id = %file.message_id, "joining in-flight decrypt");
                    (*generation, fut.clone())
                }
                None => {
                    let generation = self.tick();
                    let fut = self.start(file.clone());
                    entries.insert(
                        file.message_id.clone(),
                        Entry::Pending {
                            generation,
                            fut: fut.clone(),
                        },
                    );
                    (generation, fut)
                }
            }
        };

        let result = fut.await;
        self.settle(&file.message_id, generation, &result);
        result
    }

    fn start(&self, file: EncryptedFile) -> PendingDecrypt {
        let crypto = self.crypto.clone();
        let blobs = self.blobs.clone();
        let fetches = self.fetches.clone();

        async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            let cipher_text = blobs
                .get(&file.path)
                .await
                .map_err(|e| Arc::new(E2eError::Fetch(e.to_string())))?;
            let plain = crypto
                .decrypt_file(&file.sender, &cipher_text, &file.header)
                .map_err(Arc::new)?;
            Ok(Arc::new(ObjectHandle::new(Bytes::from(plain))))
        }
        .boxed()
        .shared()
    }

    // Only the entry that started this decrypt may be replaced. A result
    // that was invalidated in the meantime is revoked, since callers
    // already hold it.
    fn settle(&self, message_id: &str, generation: u64, result: &DecryptResult) {
        let mut entries = self.entries.lock();
        match entries.get(message_id) {
            Some(Entry::Pending { generation: g, .. }) if *g == generation => {}
            // a co-waiter on the same decrypt settled first
            Some(Entry::Ready { handle, .. })
                if matches!(result, Ok(ours) if Arc::ptr_eq(ours, handle)) =>
            {
                return;
            }
            _ => {
                if let Ok(handle) = result {
                    debug!(message_id, "decrypt finished after invalidation");
                    handle.revoke();
                }
                return;
            }
        }

        match result {
            Ok(handle) => {
                let last_used = self.tick();
                entries.insert(
                    message_id.to_string(),
                    Entry::Ready {
                        handle: handle.clone(),
                        last_used,
                    },
                );
                Self::evict_over_capacity(&mut entries, self.capacity);
            }
            Err(e) => {
                warn!(message_id, error = %e, "attachment decrypt failed");
                entries.remove(message_id);
            }
        }
    }

    fn evict_over_capacity(entries: &mut HashMap<String, Entry>, capacity: usize) {
        loop {
            let ready = entries
                .iter()
                .filter_map(|(id, entry)| match entry {
                    Entry::Ready { last_used, .. } => Some((id, *last_used)),
                    Entry::Pending { .. } => None,
                });
            let count = ready.clone().count();
            if count <= capacity {
                return;
            }
            let Some(oldest) = ready.min_by_key(|(_, used)| *used).map(|(id, _)| id.clone()) else {
                return;
            };
            if let Some(Entry::Ready { handle, .. }) = entries.remove(&oldest) {
                debug!(message_id = %oldest, "evicting decrypted object");
                handle.revoke();
            }
        }
    }

    /// Release the handle for one message (e.g. the message was deleted).
    pub fn invalidate(&self, message_id: &str) -> bool {
        match self.entries.lock().remove(message_id) {
            Some(Entry::Ready { handle, .. }) => {
                handle.revoke();
                true
            }
            Some(Entry::Pending { .. }) => true,
            None => false,
        }
    }

    /// Release every handle.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            if let Entry::Ready { handle, .. } = entry {
                handle.revoke();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::database::Database;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use crate::registry::KeyRegistry;
    use crate::signaling::SignalingStore;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Blob store that holds every `get` until released.
    struct GatedBlobs {
        inner: MemoryBlobStore,
        gate: Notify,
    }

    #[async_trait]
    impl BlobStore for GatedBlobs {
        async fn put(&self, path: &str, data: Bytes) -> crate::error::Result<()> {
            self.inner.put(path, data).await
        }

        async fn get(&self, path: &str) -> Result<Bytes, StoreError> {
            self.gate.notified().await;
            self.inner.get(path).await
        }
    }

    struct Fixture {
        alice: Arc<MessageCrypto>,
        bob: Arc<MessageCrypto>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());
        let db = Database::open_in_memory().unwrap();
        let mk = |uid: &str| {
            Arc::new(KeyRegistry::new(
                db.ensure_keypair(&UserId::from(uid)).unwrap(),
                store.clone(),
            ))
        };
        let alice = mk("alice");
        let bob = mk("bob");
        alice.publish().await.unwrap();
        bob.publish().await.unwrap();
        Fixture {
            alice: Arc::new(MessageCrypto::new(alice)),
            bob: Arc::new(MessageCrypto::new(bob)),
        }
    }

    async fn upload(fx: &Fixture, blobs: &dyn BlobStore, id: &str, data: &[u8]) -> EncryptedFile {
        let (cipher_text, doc) = fx.alice.encrypt_file(&UserId::from("bob"), data).await.unwrap();
        let path = format!("files/{id}");
        blobs.put(&path, cipher_text).await.unwrap();
        EncryptedFile {
            message_id: id.to_string(),
            path,
            sender: UserId::from("alice"),
            header: doc.key_header().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_decrypt() {
        let fx = fixture().await;
        let blobs = Arc::new(GatedBlobs {
            inner: MemoryBlobStore::new(),
            gate: Notify::new(),
        });
        let file = upload(&fx, &blobs.inner, "m1", b"picture").await;
        let cache = DecryptCache::new(fx.bob.clone(), blobs.clone());

        let (a, b, _) = tokio::join!(cache.get(&file), cache.get(&file), async {
            tokio::task::yield_now().await;
            blobs.gate.notify_one();
        });

        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_revoked());
        assert_eq!(&a.data().unwrap()[..], b"picture");
        assert_eq!(blobs.inner.fetch_count(), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_ready_handle_is_reused() {
        let fx = fixture().await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let file = upload(&fx, blobs.as_ref(), "m1", b"doc").await;
        let cache = DecryptCache::new(fx.bob.clone(), blobs.clone());

        let first = cache.get(&file).await.unwrap();
        let second = cache.get(&file).await.unwrap();
        assert_eq!(first.url(), second.url());
        assert!(first.url().starts_with("blob:"));
        assert_eq!(cache.stats(), CacheStats { fetches: 1, hits: 1 });
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let fx = fixture().await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut file = upload(&fx, blobs.as_ref(), "m1", b"doc").await;
        file.path = "files/missing".into();
        let cache = DecryptCache::new(fx.bob.clone(), blobs.clone());

        let err = cache.get(&file).await.unwrap_err();
        assert!(matches!(*err, E2eError::Fetch(_)));
        assert!(cache.is_empty());

        // a retry starts a fresh fetch
        assert!(cache.get(&file).await.is_err());
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let fx = fixture().await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let file = upload(&fx, blobs.as_ref(), "m1", b"doc").await;
        // alice reading a file as if bob had sent it uses the recipient wrap
        let mut as_recipient = file.clone();
        as_recipient.sender = UserId::from("bob");
        let cache = DecryptCache::new(fx.alice.clone(), blobs.clone());

        let err = cache.get(&as_recipient).await.unwrap_err();
        assert!(matches!(*err, E2eError::DecryptionFailed));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_revoke() {
        let fx = fixture().await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let f1 = upload(&fx, blobs.as_ref(), "m1", b"one").await;
        let f2 = upload(&fx, blobs.as_ref(), "m2", b"two").await;
        let cache = DecryptCache::new(fx.bob.clone(), blobs.clone());

        let h1 = cache.get(&f1).await.unwrap();
        let h2 = cache.get(&f2).await.unwrap();

        assert!(cache.invalidate("m1"));
        assert!(h1.is_revoked());
        assert_eq!(h1.data(), None);
        assert!(!cache.invalidate("m1"));

        cache.clear();
        assert!(h2.is_revoked());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_during_decrypt_revokes_the_result() {
        let fx = fixture().await;
        let blobs = Arc::new(GatedBlobs {
            inner: MemoryBlobStore::new(),
            gate: Notify::new(),
        });
        let file = upload(&fx, &blobs.inner, "m1", b"secret").await;
        let cache = DecryptCache::new(fx.bob.clone(), blobs.clone());

        let (result, _) = tokio::join!(cache.get(&file), async {
            tokio::task::yield_now().await;
            assert!(cache.invalidate("m1"));
            blobs.gate.notify_one();
        });

        let handle = result.unwrap();
        assert!(handle.is_revoked());
        assert_eq!(handle.data(), None);
        assert!(cache.is_empty());

        // the next request decrypts afresh
        blobs.gate.notify_one();
        let fresh = cache.get(&file).await.unwrap();
        assert_eq!(&fresh.data().unwrap()[..], b"secret");
        assert_eq!(cache.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let fx = fixture().await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let f1 = upload(&fx, blobs.as_ref(), "m1", b"one").await;
        let f2 = upload(&fx, blobs.as_ref(), "m2", b"two").await;
        let f3 = upload(&fx, blobs.as_ref(), "m3", b"three").await;
        let cache = DecryptCache::with_capacity(fx.bob.clone(), blobs.clone(), 2);

        let h1 = cache.get(&f1).await.unwrap();
        let h2 = cache.get(&f2).await.unwrap();
        cache.get(&f1).await.unwrap();
        cache.get(&f3).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(h2.is_revoked());
        assert!(!h1.is_revoked());
    }
}

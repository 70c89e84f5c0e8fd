//! Public key registry: publishes our public key under `userKeys/{uid}` and
//! fetches (and caches) everyone else's.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_shared::keys::public_key_from_b64;
use murmur_shared::paths;
use murmur_shared::protocol::PublicKeyEntry;
use murmur_shared::{KeyPair, UserId};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::error::E2eError;
use crate::keys::StoredKeyPair;
use crate::signaling::SignalingStore;

pub struct KeyRegistry {
    uid: UserId,
    keypair: KeyPair,
    created_at: i64,
    store: Arc<dyn SignalingStore>,
    cache: RwLock<HashMap<UserId, PublicKey>>,
}

impl KeyRegistry {
    pub fn new(local: StoredKeyPair, store: Arc<dyn SignalingStore>) -> Self {
        Self {
            uid: local.uid,
            keypair: local.keypair,
            created_at: local.created_at.timestamp_millis(),
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn uid(&self) -> &UserId {
        &self.uid
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Make sure the registry holds our current public key. A missing entry
    /// is written; an entry naming a different key is overwritten, since
    /// nobody could read messages sealed for it on this device anyway.
    pub async fn publish(&self) -> Result<(), E2eError> {
        let path = paths::user_key(&self.uid);
        let ours = self.keypair.public_key_b64();

        let existing = self
            .store
            .read(&path)
            .await?
            .and_then(|v| serde_json::from_value::<PublicKeyEntry>(v).ok());

        match existing {
            Some(entry) if entry.public_key == ours => {
                debug!(uid = %self.uid.short(), "public key already registered");
                return Ok(());
            }
            Some(_) => {
                warn!(uid = %self.uid.short(), "registered public key differs from local keypair, republishing");
            }
            None => {
                info!(uid = %self.uid.short(), "publishing public key");
            }
        }

        let entry = PublicKeyEntry {
            public_key: ours,
            created_at: self.created_at,
        };
        let value = serde_json::to_value(&entry).map_err(crate::StoreError::from)?;
        self.store.write(&path, value).await?;
        Ok(())
    }

    /// Counterpart public key, fetched once and cached.
    pub async fn public_key_of(&self, uid: &UserId) -> Result<PublicKey, E2eError> {
        if uid == &self.uid {
            return Ok(*self.keypair.public_key());
        }
        if let Some(key) = self.cache.read().get(uid) {
            return Ok(*key);
        }

        let value = self
            .store
            .read(&paths::user_key(uid))
            .await?
            .ok_or_else(|| E2eError::KeyNotFound(uid.clone()))?;
        let entry: PublicKeyEntry = serde_json::from_value(value)
            .map_err(|_| E2eError::KeyNotFound(uid.clone()))?;
        let key = public_key_from_b64(&entry.public_key)?;

        debug!(uid = %uid.short(), "cached counterpart public key");
        self.cache.write().insert(uid.clone(), key);
        Ok(key)
    }

    /// Drop a cached counterpart key so the next lookup refetches it.
    pub fn forget(&self, uid: &UserId) {
        self.cache.write().remove(uid);
    }
}

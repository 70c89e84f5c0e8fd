//! # murmur-store
//!
//! Storage seams for Murmur: the realtime signaling store used as the call
//! rendezvous channel, the blob store for encrypted attachments, and the
//! device-local SQLite database that holds this device's keypair.
//!
//! On top of those sit the end-to-end pieces that need storage: the public
//! key registry, document-level message encryption and the decrypt cache.

pub mod blobs;
pub mod database;
pub mod decrypt_cache;
pub mod e2e;
pub mod keys;
pub mod memory;
pub mod migrations;
pub mod registry;
pub mod signaling;

mod error;

pub use blobs::{BlobStore, MemoryBlobStore};
pub use database::Database;
pub use decrypt_cache::{DecryptCache, EncryptedFile, ObjectHandle};
pub use e2e::{DocumentContent, MessageCrypto};
pub use error::{E2eError, Result, StoreError};
pub use memory::MemoryStore;
pub use registry::KeyRegistry;
pub use signaling::{SignalingStore, Subscription};

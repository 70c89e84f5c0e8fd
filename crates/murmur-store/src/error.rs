use murmur_shared::{CryptoError, UserId};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from the local key database.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored value did not have the expected shape.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored key material failed to decode.
    #[error("Key material error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid store path (empty, or addressing a non-object).
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The remote store could not be reached.
    #[error("Signaling store unavailable")]
    Unavailable,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the end-to-end encryption layer.
///
/// Every variant is fail-closed: callers render them as a locked
/// placeholder, never as partial plaintext.
#[derive(Error, Debug)]
pub enum E2eError {
    #[error("No public key registered for {0}")]
    KeyNotFound(UserId),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch failed: {0}")]
    Fetch(String),
}

impl From<CryptoError> for E2eError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => E2eError::DecryptionFailed,
            other => E2eError::Crypto(other),
        }
    }
}

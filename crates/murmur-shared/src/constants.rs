/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Sealed key layout: ephemeral public key || wrapped key || tag
pub const SEALED_KEY_SIZE: usize = PUBKEY_SIZE + SYMMETRIC_KEY_SIZE + TAG_SIZE;

/// Seconds a caller waits for an answer before ending the call
pub const RING_TIMEOUT_SECS: u64 = 30;

/// Grace period before a finished call record and its candidates are deleted
pub const TEARDOWN_DELAY_MS: u64 = 3_000;

/// Interval between two connection statistics samples
pub const STATS_INTERVAL_MS: u64 = 1_000;

/// Default STUN server used when none is configured
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SEAL_KEY: &str = "murmur-seal-key-v1";
pub const KDF_CONTEXT_SEAL_NONCE: &str = "murmur-seal-nonce-v1";

/// Shown in place of content that cannot be decrypted
pub const LOCKED_PLACEHOLDER: &str = "[encrypted message]";

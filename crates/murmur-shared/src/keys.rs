use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::crypto::{b64_decode_array, b64_encode};
use crate::error::CryptoError;

/// A user's long-lived X25519 keypair.
/// The secret half stays on this device; only [`KeyPair::public_key_b64`] is
/// ever published.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore from raw secret bytes
    pub fn from_secret_bytes(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(secret))
    }

    pub fn from_secret_b64(secret: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_secret_bytes(b64_decode_array(secret)?))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_b64(&self) -> String {
        b64_encode(self.public.as_bytes())
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Only for the local key store.
    pub fn secret_b64(&self) -> String {
        b64_encode(&self.secret.to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

pub fn public_key_from_b64(s: &str) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; PUBKEY_SIZE] = b64_decode_array(s)?;
    Ok(PublicKey::from(bytes))
}

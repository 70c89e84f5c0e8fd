use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_SEAL_KEY, KDF_CONTEXT_SEAL_NONCE, NONCE_SIZE, PUBKEY_SIZE, SEALED_KEY_SIZE,
    SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];
pub type Nonce = [u8; NONCE_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// XChaCha20-Poly1305 with a caller-supplied nonce. Output is ciphertext || tag.
pub fn encrypt(key: &SymmetricKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// Anonymous wrap: fresh ephemeral X25519 key per call, BLAKE3 KDF over the
// shared secret and both public keys. The one-time key makes the derived
// nonce safe to reuse.
fn seal_params(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> (SymmetricKey, Nonce) {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEAL_KEY);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    let key = *hasher.finalize().as_bytes();

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEAL_NONCE);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    let hash = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hash.as_bytes()[..NONCE_SIZE]);

    (key, nonce)
}

/// Wrap a symmetric key so only the holder of `recipient`'s secret can open it.
///
/// Layout: `ephemeral public key (32) || ciphertext (32) || tag (16)`.
pub fn seal_key(recipient: &PublicKey, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::EncryptionFailed);
    }

    let (wrap_key, nonce) = seal_params(shared.as_bytes(), &ephemeral, recipient);
    let wrapped = encrypt(&wrap_key, &nonce, key)?;

    let mut out = Vec::with_capacity(SEALED_KEY_SIZE);
    out.extend_from_slice(ephemeral.as_bytes());
    out.extend_from_slice(&wrapped);
    Ok(out)
}

pub fn open_key(secret: &StaticSecret, sealed: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if sealed.len() != SEALED_KEY_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, wrapped) = sealed.split_at(PUBKEY_SIZE);
    let mut eph = [0u8; PUBKEY_SIZE];
    eph.copy_from_slice(ephemeral_bytes);
    let ephemeral = PublicKey::from(eph);
    let recipient = PublicKey::from(secret);

    let shared = secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let (wrap_key, nonce) = seal_params(shared.as_bytes(), &ephemeral, &recipient);
    let plain = decrypt(&wrap_key, &nonce, wrapped)?;

    plain
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

pub fn b64_decode_array<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    b64_decode(s)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_SIZE;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let nonce = generate_nonce();
        let plaintext = b"Hello";

        let encrypted = encrypt(&key, &nonce, plaintext).unwrap();
        assert_eq!(encrypted.len(), plaintext.len() + TAG_SIZE);

        let decrypted = decrypt(&key, &nonce, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();
        let nonce = generate_nonce();

        let encrypted = encrypt(&key1, &nonce, b"Secret message").unwrap();
        assert_eq!(decrypt(&key2, &nonce, &encrypted), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();
        let nonce = generate_nonce();

        let mut encrypted = encrypt(&key, &nonce, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &nonce, &encrypted).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let key = generate_symmetric_key();

        let sealed = seal_key(&public, &key).unwrap();
        assert_eq!(sealed.len(), SEALED_KEY_SIZE);
        assert_eq!(open_key(&secret, &sealed).unwrap(), key);
    }

    #[test]
    fn test_seal_is_randomized() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let key = generate_symmetric_key();

        assert_ne!(seal_key(&public, &key).unwrap(), seal_key(&public, &key).unwrap());
    }

    #[test]
    fn test_open_with_other_secret_fails() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let other = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let sealed = seal_key(&PublicKey::from(&secret), &generate_symmetric_key()).unwrap();

        assert_eq!(open_key(&other, &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_open_truncated_fails() {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let sealed = seal_key(&PublicKey::from(&secret), &generate_symmetric_key()).unwrap();

        assert!(open_key(&secret, &sealed[..sealed.len() - 1]).is_err());
        assert!(open_key(&secret, &[]).is_err());
    }

    #[test]
    fn test_base64_is_url_safe_unpadded() {
        let bytes = [0xFBu8, 0xFF, 0xBF, 0x01];
        let encoded = b64_encode(&bytes);
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
        assert_eq!(b64_decode(&encoded).unwrap(), bytes);
    }
}

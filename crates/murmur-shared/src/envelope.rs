//! Dual-wrapped message envelopes.
//!
//! Every message or file gets a fresh symmetric key `K`. The payload is
//! sealed under `K` with XChaCha20-Poly1305, then `K` is wrapped twice: once
//! for the recipient and once for the sender, so the sender can re-read its
//! own history without keeping a plaintext copy. `K` itself only ever lives
//! on the stack of [`seal_bytes`] / [`open_bytes`].

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::crypto::{
    self, b64_decode, b64_decode_array, b64_encode, generate_nonce, generate_symmetric_key,
    SymmetricKey,
};
use crate::error::CryptoError;
use crate::keys::KeyPair;

/// Which wrapped key a reader must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reader {
    /// The author of the envelope, reading `encryptedKeyForSelf`.
    Sender,
    /// The addressee, reading `encryptedKeyForRecipient`.
    Recipient,
}

/// Nonce plus both wrapped copies of the payload key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyHeader {
    pub iv: String,
    pub encrypted_key_for_recipient: String,
    pub encrypted_key_for_self: String,
}

impl KeyHeader {
    fn wrapped_for(&self, reader: Reader) -> &str {
        match reader {
            Reader::Sender => &self.encrypted_key_for_self,
            Reader::Recipient => &self.encrypted_key_for_recipient,
        }
    }
}

/// `(cipherText, iv, encryptedKeyForRecipient, encryptedKeyForSelf)`, all
/// base64url without padding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub cipher_text: String,
    pub iv: String,
    pub encrypted_key_for_recipient: String,
    pub encrypted_key_for_self: String,
}

impl MessageEnvelope {
    pub fn header(&self) -> KeyHeader {
        KeyHeader {
            iv: self.iv.clone(),
            encrypted_key_for_recipient: self.encrypted_key_for_recipient.clone(),
            encrypted_key_for_self: self.encrypted_key_for_self.clone(),
        }
    }
}

/// Encrypt raw bytes for `recipient`, keeping a self-wrapped key for `sender`.
/// Returns the raw ciphertext (for blob upload) and the key header.
pub fn seal_bytes(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &PublicKey,
) -> Result<(Vec<u8>, KeyHeader), CryptoError> {
    let key = generate_symmetric_key();
    let nonce = generate_nonce();

    let cipher_text = crypto::encrypt(&key, &nonce, plaintext)?;
    let for_recipient = crypto::seal_key(recipient, &key)?;
    let for_self = crypto::seal_key(sender, &key)?;

    Ok((
        cipher_text,
        KeyHeader {
            iv: b64_encode(&nonce),
            encrypted_key_for_recipient: b64_encode(&for_recipient),
            encrypted_key_for_self: b64_encode(&for_self),
        },
    ))
}

/// Recover the payload key from the wrap that belongs to `reader`.
pub fn unwrap_key(
    header: &KeyHeader,
    keypair: &KeyPair,
    reader: Reader,
) -> Result<SymmetricKey, CryptoError> {
    let sealed = b64_decode(header.wrapped_for(reader)).map_err(|_| CryptoError::DecryptionFailed)?;
    crypto::open_key(keypair.secret(), &sealed)
}

pub fn open_bytes(
    cipher_text: &[u8],
    header: &KeyHeader,
    keypair: &KeyPair,
    reader: Reader,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = b64_decode_array(&header.iv).map_err(|_| CryptoError::DecryptionFailed)?;
    let key = unwrap_key(header, keypair, reader)?;
    crypto::decrypt(&key, &nonce, cipher_text)
}

pub fn seal_message(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &PublicKey,
) -> Result<MessageEnvelope, CryptoError> {
    let (cipher_text, header) = seal_bytes(plaintext, recipient, sender)?;
    Ok(MessageEnvelope {
        cipher_text: b64_encode(&cipher_text),
        iv: header.iv,
        encrypted_key_for_recipient: header.encrypted_key_for_recipient,
        encrypted_key_for_self: header.encrypted_key_for_self,
    })
}

pub fn open_message(
    envelope: &MessageEnvelope,
    keypair: &KeyPair,
    reader: Reader,
) -> Result<Vec<u8>, CryptoError> {
    let cipher_text = b64_decode(&envelope.cipher_text).map_err(|_| CryptoError::DecryptionFailed)?;
    open_bytes(&cipher_text, &envelope.header(), keypair, reader)
}

/// Chat message / file document fields read by the crypto layer. Anything
/// else on the document belongs to the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key_for_self: Option<String>,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl MessageDocument {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn encrypted(envelope: MessageEnvelope) -> Self {
        Self {
            text: None,
            encrypted_text: Some(envelope.cipher_text),
            iv: Some(envelope.iv),
            encrypted_key: Some(envelope.encrypted_key_for_recipient),
            encrypted_key_for_self: Some(envelope.encrypted_key_for_self),
            is_encrypted: true,
        }
    }

    /// File documents carry the header only; the ciphertext lives in the blob store.
    pub fn key_header(&self) -> Option<KeyHeader> {
        Some(KeyHeader {
            iv: self.iv.clone()?,
            encrypted_key_for_recipient: self.encrypted_key.clone()?,
            encrypted_key_for_self: self.encrypted_key_for_self.clone()?,
        })
    }

    /// `None` when any envelope field is missing.
    pub fn envelope(&self) -> Option<MessageEnvelope> {
        let header = self.key_header()?;
        Some(MessageEnvelope {
            cipher_text: self.encrypted_text.clone()?,
            iv: header.iv,
            encrypted_key_for_recipient: header.encrypted_key_for_recipient,
            encrypted_key_for_self: header.encrypted_key_for_self,
        })
    }
}

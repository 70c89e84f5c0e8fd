//! Document-level end-to-end encryption on top of the envelope codec.

use std::sync::Arc;

use bytes::Bytes;
use murmur_shared::constants::LOCKED_PLACEHOLDER;
use murmur_shared::envelope::{self, KeyHeader, MessageDocument, MessageEnvelope, Reader};
use murmur_shared::UserId;
use tracing::{debug, warn};

use crate::error::E2eError;
use crate::registry::KeyRegistry;

/// What a reader gets back from a message document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    /// Sent without encryption.
    Plain(String),
    Decrypted(String),
    /// Undecryptable; carries the reason for logs, never shown as content.
    Locked(String),
}

impl DocumentContent {
    pub fn display_text(&self) -> &str {
        match self {
            DocumentContent::Plain(text) | DocumentContent::Decrypted(text) => text,
            DocumentContent::Locked(_) => LOCKED_PLACEHOLDER,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, DocumentContent::Locked(_))
    }
}

pub struct MessageCrypto {
    registry: Arc<KeyRegistry>,
}

impl MessageCrypto {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    fn reader_for(&self, sender: &UserId) -> Reader {
        if sender == self.registry.uid() {
            Reader::Sender
        } else {
            Reader::Recipient
        }
    }

    pub async fn encrypt_for(
        &self,
        recipient: &UserId,
        plaintext: &[u8],
    ) -> Result<MessageEnvelope, E2eError> {
        let recipient_key = self.registry.public_key_of(recipient).await?;
        let own_key = self.registry.keypair().public_key();
        Ok(envelope::seal_message(plaintext, &recipient_key, own_key)?)
    }

    /// `sender` decides which wrap we open: our own for messages we wrote,
    /// the recipient wrap for everything else.
    pub fn decrypt_from(
        &self,
        sender: &UserId,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<u8>, E2eError> {
        let reader = self.reader_for(sender);
        Ok(envelope::open_message(envelope, self.registry.keypair(), reader)?)
    }

    pub async fn encrypt_text(
        &self,
        recipient: &UserId,
        text: &str,
    ) -> Result<MessageDocument, E2eError> {
        let envelope = self.encrypt_for(recipient, text.as_bytes()).await?;
        Ok(MessageDocument::encrypted(envelope))
    }

    /// Never fails: anything that cannot be decrypted comes back `Locked`.
    pub fn read_document(&self, sender: &UserId, doc: &MessageDocument) -> DocumentContent {
        if !doc.is_encrypted {
            return DocumentContent::Plain(doc.text.clone().unwrap_or_default());
        }

        let Some(envelope) = doc.envelope() else {
            warn!(sender = %sender.short(), "encrypted document is missing envelope fields");
            return DocumentContent::Locked("incomplete envelope".to_string());
        };

        match self.decrypt_from(sender, &envelope) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => DocumentContent::Decrypted(text),
                Err(_) => DocumentContent::Locked("payload is not text".to_string()),
            },
            Err(e) => {
                debug!(sender = %sender.short(), error = %e, "message stays locked");
                DocumentContent::Locked(e.to_string())
            }
        }
    }

    /// Encrypt an attachment. The ciphertext goes to the blob store, the
    /// returned document carries only the key header.
    pub async fn encrypt_file(
        &self,
        recipient: &UserId,
        data: &[u8],
    ) -> Result<(Bytes, MessageDocument), E2eError> {
        let recipient_key = self.registry.public_key_of(recipient).await?;
        let own_key = self.registry.keypair().public_key();
        let (cipher_text, header) = envelope::seal_bytes(data, &recipient_key, own_key)?;

        let doc = MessageDocument {
            iv: Some(header.iv),
            encrypted_key: Some(header.encrypted_key_for_recipient),
            encrypted_key_for_self: Some(header.encrypted_key_for_self),
            is_encrypted: true,
            ..Default::default()
        };
        Ok((Bytes::from(cipher_text), doc))
    }

    pub fn decrypt_file(
        &self,
        sender: &UserId,
        cipher_text: &[u8],
        header: &KeyHeader,
    ) -> Result<Vec<u8>, E2eError> {
        let reader = self.reader_for(sender);
        Ok(envelope::open_bytes(cipher_text, header, self.registry.keypair(), reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::memory::MemoryStore;
    use crate::signaling::SignalingStore;

    async fn pair() -> (MessageCrypto, MessageCrypto) {
        let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());
        let db = Database::open_in_memory().unwrap();
        let mut out = Vec::new();
        for uid in ["alice", "bob"] {
            let registry = KeyRegistry::new(db.ensure_keypair(&UserId::from(uid)).unwrap(), store.clone());
            registry.publish().await.unwrap();
            out.push(MessageCrypto::new(Arc::new(registry)));
        }
        let bob = out.pop().unwrap();
        let alice = out.pop().unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_hello_readable_by_both_sides() {
        let (alice, bob) = pair().await;
        let alice_id = UserId::from("alice");

        let doc = alice.encrypt_text(&UserId::from("bob"), "Hello").await.unwrap();

        assert_eq!(
            bob.read_document(&alice_id, &doc),
            DocumentContent::Decrypted("Hello".into())
        );
        assert_eq!(
            alice.read_document(&alice_id, &doc),
            DocumentContent::Decrypted("Hello".into())
        );
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let (alice, _) = pair().await;
        let err = alice.encrypt_for(&UserId::from("carol"), b"hi").await.unwrap_err();
        assert!(matches!(err, E2eError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_wrong_reader_is_locked() {
        let (alice, bob) = pair().await;
        let envelope = alice.encrypt_for(&UserId::from("bob"), b"Hello").await.unwrap();

        // bob claiming to be the sender picks the self wrap and fails closed
        let err = bob.decrypt_from(&UserId::from("bob"), &envelope).unwrap_err();
        assert!(matches!(err, E2eError::DecryptionFailed));

        let doc = MessageDocument::encrypted(envelope);
        let content = bob.read_document(&UserId::from("bob"), &doc);
        assert!(content.is_locked());
        assert_eq!(content.display_text(), LOCKED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_plain_and_incomplete_documents() {
        let (alice, _) = pair().await;
        let sender = UserId::from("bob");

        assert_eq!(
            alice.read_document(&sender, &MessageDocument::plain("hey")),
            DocumentContent::Plain("hey".into())
        );

        let broken = MessageDocument {
            is_encrypted: true,
            encrypted_text: Some("abc".into()),
            ..Default::default()
        };
        assert!(alice.read_document(&sender, &broken).is_locked());
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let (alice, bob) = pair().await;
        let (cipher_text, doc) = alice
            .encrypt_file(&UserId::from("bob"), b"\x89PNG fake image")
            .await
            .unwrap();
        let header = doc.key_header().unwrap();
        assert!(doc.encrypted_text.is_none());

        let plain = bob
            .decrypt_file(&UserId::from("alice"), &cipher_text, &header)
            .unwrap();
        assert_eq!(plain, b"\x89PNG fake image");
    }
}

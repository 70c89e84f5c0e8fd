use thiserror::Error;

#[derive(Error, Debug)]
pub enum MurmurError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid base64 value: {0}")]
    Encoding(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed call id: {0}")]
    MalformedCallId(String),

    #[error("Unknown call status: {0}")]
    UnknownStatus(String),

    #[error("Unexpected session description type: {0}")]
    UnexpectedSdpType(String),
}

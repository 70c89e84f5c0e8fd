// Types, wire records and cryptography shared by every Murmur crate.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod paths;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, MurmurError, ProtocolError};
pub use keys::KeyPair;
pub use types::{CallId, ConnectionMode, TrackKind, UserId};

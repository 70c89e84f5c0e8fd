use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Account id issued by the managed backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `callerId_receiverId_timestampMillis`
///
/// Backend uids never contain `_`, so the id splits back into its parts from
/// the right.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(caller: &UserId, receiver: &UserId, timestamp_ms: i64) -> Self {
        Self(format!("{caller}_{receiver}_{timestamp_ms}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the id back into `(caller, receiver, timestamp)`.
    pub fn parts(&self) -> Result<(UserId, UserId, i64), ProtocolError> {
        let malformed = || ProtocolError::MalformedCallId(self.0.clone());
        let mut it = self.0.rsplitn(3, '_');
        let ts = it.next().ok_or_else(malformed)?;
        let receiver = it.next().ok_or_else(malformed)?;
        let caller = it.next().ok_or_else(malformed)?;
        if caller.is_empty() || receiver.is_empty() {
            return Err(malformed());
        }
        let ts = ts.parse::<i64>().map_err(|_| malformed())?;
        Ok((UserId::from(caller), UserId::from(receiver), ts))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CallId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        id.parts()?;
        Ok(id)
    }
}

/// Network route selected for the media connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    Direct,
    Relayed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

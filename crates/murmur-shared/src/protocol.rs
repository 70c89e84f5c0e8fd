//! Records exchanged through the shared signaling store.
//!
//! Field names follow the JSON layout the web clients already write
//! (camelCase), so a native peer and a browser peer can share one call.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{CallId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    /// `rejected` and `ended` close the record for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }
}

impl std::str::FromStr for CallStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calling" => Ok(CallStatus::Calling),
            "accepted" => Ok(CallStatus::Accepted),
            "rejected" => Ok(CallStatus::Rejected),
            "ended" => Ok(CallStatus::Ended),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn require(self, sdp_type: SdpType) -> Result<Self, ProtocolError> {
        if self.sdp_type == sdp_type {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedSdpType(format!("{:?}", self.sdp_type)))
        }
    }
}

/// `calls/{callId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub is_video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl CallRecord {
    /// The party on the other side of `me`, if `me` takes part in this call.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if &self.caller_id == me {
            Some(&self.receiver_id)
        } else if &self.receiver_id == me {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

/// `users/{uid}/incomingCall`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPointer {
    pub call_id: CallId,
    pub from: UserId,
    pub is_video: bool,
    pub timestamp: i64,
}

/// Trickled network candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// One entry of `ice_candidates/{callId}/*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateRecord {
    pub candidate: IceCandidate,
    pub from: UserId,
    pub timestamp: i64,
}

/// Advisory busy state under `users/{uid}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceFlags {
    #[serde(default)]
    pub user_in_call: bool,
    #[serde(default)]
    pub current_call_id: Option<CallId>,
    #[serde(default)]
    pub other_user_id: Option<UserId>,
}

/// `userKeys/{uid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyEntry {
    pub public_key: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_record_wire_shape() {
        let record = CallRecord {
            caller_id: UserId::from("alice"),
            receiver_id: UserId::from("bob"),
            status: CallStatus::Calling,
            is_video: true,
            offer: Some(SessionDescription::offer("v=0")),
            answer: None,
            timestamp: 42,
            ended_at: None,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "callerId": "alice",
                "receiverId": "bob",
                "status": "calling",
                "isVideo": true,
                "offer": { "type": "offer", "sdp": "v=0" },
                "timestamp": 42
            })
        );
    }

    #[test]
    fn test_candidate_reads_browser_json() {
        let value = json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let candidate: IceCandidate = serde_json::from_value(value).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Calling.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert_eq!("accepted".parse::<CallStatus>().unwrap(), CallStatus::Accepted);
        assert!("ringing".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_counterpart() {
        let record = CallRecord {
            caller_id: UserId::from("alice"),
            receiver_id: UserId::from("bob"),
            status: CallStatus::Accepted,
            is_video: false,
            offer: None,
            answer: None,
            timestamp: 0,
            ended_at: None,
        };
        assert_eq!(record.counterpart(&UserId::from("alice")), Some(&UserId::from("bob")));
        assert_eq!(record.counterpart(&UserId::from("carol")), None);
    }
}

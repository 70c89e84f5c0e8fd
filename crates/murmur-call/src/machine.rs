//! Call session states and the single transition function.
//!
//! The manager feeds every observation (local command, record change,
//! transport event, timer) through [`transition`] and performs the side
//! effects of the outcome. Nothing here touches the network.

use murmur_shared::protocol::CallStatus;
use murmur_shared::{CallId, ConnectionMode};
use serde::Serialize;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Offer written, waiting for the callee.
    Calling(CallId),
    /// Incoming call observed, not yet answered.
    Ringing(CallId),
    Connected(CallId),
    Ended(CallId, EndReason),
}

impl CallState {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            CallState::Idle => None,
            CallState::Calling(id)
            | CallState::Ringing(id)
            | CallState::Connected(id)
            | CallState::Ended(id, _) => Some(id),
        }
    }

    /// A session exists and owns (or is about to own) local resources.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallState::Calling(_) | CallState::Ringing(_) | CallState::Connected(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling(_) => "calling",
            CallState::Ringing(_) => "ringing",
            CallState::Connected(_) => "connected",
            CallState::Ended(..) => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    /// The callee declined, locally or as observed by the caller.
    Rejected,
    Timeout,
    RemoteHangup,
    ConnectionFailed,
    RecordDeleted,
    /// Torn down to make room for a newer call.
    Superseded,
}

impl EndReason {
    /// The error a caller waiting on this call should see, if any.
    pub fn as_error(&self) -> Option<CallError> {
        match self {
            EndReason::Timeout => Some(CallError::SignalingTimeout),
            EndReason::ConnectionFailed => {
                Some(CallError::ConnectionFailed("transport failed".into()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dialed(CallId),
    Rang(CallId),
    /// Local answer written and accepted.
    Answered,
    /// Caller applied the callee's answer.
    RemoteAnswered,
    RemoteAccepted,
    RemoteTerminal(CallStatus),
    RecordDeleted,
    TimedOut,
    TransportUp(ConnectionMode),
    TransportDown,
    HungUp,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Move(CallState),
    End(EndReason),
}

pub fn transition(state: &CallState, event: &Event) -> Transition {
    use CallState::*;

    match (state, event) {
        (Idle | Ended(..), Event::Dialed(id)) => Transition::Move(Calling(id.clone())),
        (Idle | Ended(..), Event::Rang(id)) => Transition::Move(Ringing(id.clone())),
        // a live session must be torn down before another one starts
        (_, Event::Dialed(_) | Event::Rang(_)) => Transition::Stay,

        (Ringing(id), Event::Answered) => Transition::Move(Connected(id.clone())),
        (Calling(id), Event::RemoteAnswered) => Transition::Move(Connected(id.clone())),

        (Calling(_), Event::TimedOut) => Transition::End(EndReason::Timeout),

        (Calling(_), Event::RemoteTerminal(CallStatus::Rejected)) => {
            Transition::End(EndReason::Rejected)
        }
        (Calling(_) | Ringing(_) | Connected(_), Event::RemoteTerminal(status))
            if status.is_terminal() =>
        {
            Transition::End(EndReason::RemoteHangup)
        }
        (Calling(_) | Ringing(_) | Connected(_), Event::RecordDeleted) => {
            Transition::End(EndReason::RecordDeleted)
        }
        (Calling(_) | Connected(_), Event::TransportDown) => {
            Transition::End(EndReason::ConnectionFailed)
        }

        (Ringing(_), Event::HungUp) => Transition::End(EndReason::Rejected),
        (Calling(_) | Connected(_), Event::HungUp) => Transition::End(EndReason::LocalHangup),
        (Calling(_) | Ringing(_) | Connected(_), Event::Superseded) => {
            Transition::End(EndReason::Superseded)
        }

        _ => Transition::Stay,
    }
}

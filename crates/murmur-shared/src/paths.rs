//! Logical layout of the shared signaling store.

use crate::types::{CallId, UserId};

pub fn call(call_id: &CallId) -> String {
    format!("calls/{call_id}")
}

pub fn call_status(call_id: &CallId) -> String {
    format!("calls/{call_id}/status")
}

pub fn call_answer(call_id: &CallId) -> String {
    format!("calls/{call_id}/answer")
}

pub fn call_ended_at(call_id: &CallId) -> String {
    format!("calls/{call_id}/endedAt")
}

pub fn ice_candidates(call_id: &CallId) -> String {
    format!("ice_candidates/{call_id}")
}

pub fn incoming_call(uid: &UserId) -> String {
    format!("users/{uid}/incomingCall")
}

pub fn user_in_call(uid: &UserId) -> String {
    format!("users/{uid}/userInCall")
}

pub fn current_call_id(uid: &UserId) -> String {
    format!("users/{uid}/currentCallId")
}

pub fn other_user_id(uid: &UserId) -> String {
    format!("users/{uid}/otherUserId")
}

pub fn user_key(uid: &UserId) -> String {
    format!("userKeys/{uid}")
}

//! Typed access to the call records in the shared store.

use std::sync::Arc;

use murmur_shared::paths;
use murmur_shared::protocol::{
    CallRecord, CallStatus, IceCandidateRecord, IncomingCallPointer, SessionDescription,
};
use murmur_shared::{CallId, UserId};
use murmur_store::{Result, SignalingStore, Subscription};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Clone)]
pub struct CallSignaling {
    store: Arc<dyn SignalingStore>,
    me: UserId,
}

impl CallSignaling {
    pub fn new(store: Arc<dyn SignalingStore>, me: UserId) -> Self {
        Self { store, me }
    }

    /// Advisory only; two callers can still race past it.
    pub async fn is_busy(&self, uid: &UserId) -> Result<bool> {
        let flag = self.store.read(&paths::user_in_call(uid)).await?;
        Ok(flag.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Record, the callee's incoming pointer and our presence in one update.
    pub async fn create_call(&self, call_id: &CallId, record: &CallRecord) -> Result<()> {
        let pointer = IncomingCallPointer {
            call_id: call_id.clone(),
            from: record.caller_id.clone(),
            is_video: record.is_video,
            timestamp: record.timestamp,
        };
        let mut writes = vec![
            (paths::call(call_id), Some(encode(record)?)),
            (paths::incoming_call(&record.receiver_id), Some(encode(&pointer)?)),
        ];
        writes.extend(self.presence_writes(&self.me, Some((call_id, &record.receiver_id))));
        self.store.update(writes).await
    }

    pub async fn read_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        self.store
            .read(&paths::call(call_id))
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn status(&self, call_id: &CallId) -> Result<Option<CallStatus>> {
        self.store
            .read(&paths::call_status(call_id))
            .await?
            .map(decode)
            .transpose()
    }

    /// Move the status `from -> to` only if nobody changed it first.
    pub async fn transition_status(
        &self,
        call_id: &CallId,
        from: CallStatus,
        to: CallStatus,
    ) -> Result<bool> {
        let swapped = self
            .store
            .compare_and_set(
                &paths::call_status(call_id),
                Some(json!(from.as_str())),
                Some(json!(to.as_str())),
            )
            .await?;
        debug!(call_id = %call_id, from = from.as_str(), to = to.as_str(), swapped, "status transition");
        Ok(swapped)
    }

    /// Answer and our presence, after the status already moved to
    /// `accepted`. Our incoming pointer is cleared only while it still names
    /// this call, so a newer caller's pointer survives.
    pub async fn publish_answer(
        &self,
        call_id: &CallId,
        caller: &UserId,
        answer: &SessionDescription,
    ) -> Result<()> {
        let mut writes = vec![(paths::call_answer(call_id), Some(encode(answer)?))];
        writes.extend(self.presence_writes(&self.me, Some((call_id, caller))));
        self.store.update(writes).await?;
        self.clear_incoming_if(&self.me, call_id).await?;
        Ok(())
    }

    pub async fn mark_ended_at(&self, call_id: &CallId, at_ms: i64) -> Result<()> {
        self.store.write(&paths::call_ended_at(call_id), json!(at_ms)).await
    }

    pub async fn clear_presence(&self, users: &[&UserId]) -> Result<()> {
        let writes = users
            .iter()
            .flat_map(|uid| self.presence_writes(uid, None))
            .collect();
        self.store.update(writes).await
    }

    /// Clear `uid`'s incoming pointer only if it still names `call_id`.
    pub async fn clear_incoming_if(&self, uid: &UserId, call_id: &CallId) -> Result<bool> {
        let path = paths::incoming_call(uid);
        let Some(current) = self.store.read(&path).await? else {
            return Ok(false);
        };
        let ours = decode::<IncomingCallPointer>(current.clone())
            .map(|p| &p.call_id == call_id)
            .unwrap_or(false);
        if !ours {
            return Ok(false);
        }
        self.store.compare_and_set(&path, Some(current), None).await
    }

    pub async fn push_candidate(&self, call_id: &CallId, record: &IceCandidateRecord) -> Result<String> {
        self.store
            .push(&paths::ice_candidates(call_id), encode(record)?)
            .await
    }

    /// Remove the record and its candidate list.
    pub async fn delete_call(&self, call_id: &CallId) -> Result<()> {
        self.store
            .update(vec![
                (paths::call(call_id), None),
                (paths::ice_candidates(call_id), None),
            ])
            .await
    }

    pub async fn subscribe_call(&self, call_id: &CallId) -> Result<Subscription<Option<Value>>> {
        self.store.subscribe(&paths::call(call_id)).await
    }

    pub async fn subscribe_candidates(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<(String, Value)>> {
        self.store
            .subscribe_children(&paths::ice_candidates(call_id))
            .await
    }

    pub async fn subscribe_incoming(&self) -> Result<Subscription<Option<Value>>> {
        self.store.subscribe(&paths::incoming_call(&self.me)).await
    }

    fn presence_writes(
        &self,
        uid: &UserId,
        call: Option<(&CallId, &UserId)>,
    ) -> Vec<(String, Option<Value>)> {
        match call {
            Some((call_id, other)) => vec![
                (paths::user_in_call(uid), Some(json!(true))),
                (paths::current_call_id(uid), Some(json!(call_id.as_str()))),
                (paths::other_user_id(uid), Some(json!(other.as_str()))),
            ],
            None => vec![
                (paths::user_in_call(uid), None),
                (paths::current_call_id(uid), None),
                (paths::other_user_id(uid), None),
            ],
        }
    }
}

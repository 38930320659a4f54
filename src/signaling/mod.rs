//! Shared signaling store contract and the typed call-record adapter on top of it.

pub mod memory;
pub mod record;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{CallError, NegotiationError, SignalingError};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::session::RecordStatus;

pub use memory::MemoryStore;
pub use record::{CallRecord, IncomingCall};

/// Invoked with the current value at a path, `None` once it is absent.
pub type ChangeCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// A subscribable key-value store shared by both parties.
///
/// `subscribe` fires once immediately with the current value and again after
/// every change. `append` generates keys that sort in append order.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn read_once(&self, path: &str) -> Result<Option<Value>, SignalingError>;

    async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<Subscription, SignalingError>;

    async fn write(&self, path: &str, value: Value) -> Result<(), SignalingError>;

    /// Writes every field below `path` in one atomic step; a `null` field is removed.
    async fn update_fields(
        &self,
        path: &str,
        fields: Map<String, Value>,
    ) -> Result<(), SignalingError>;

    async fn append(&self, path: &str, value: Value) -> Result<String, SignalingError>;

    async fn remove(&self, path: &str) -> Result<(), SignalingError>;
}

/// Handle of a live subscription. Unsubscribes on [`Subscription::cancel`] or drop.
pub struct Subscription {
    path: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path: path.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cancel(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!(path = %self.path, "unsubscribed");
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

fn to_value<T: Serialize>(path: &str, value: &T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| {
        NegotiationError::Malformed {
            path: path.to_owned(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn to_fields<T: Serialize>(path: &str, value: &T) -> Result<Map<String, Value>, CallError> {
    match to_value(path, value)? {
        Value::Object(map) => Ok(map),
        other => Err(NegotiationError::Malformed {
            path: path.to_owned(),
            reason: format!("expected an object, got {other}"),
        }
        .into()),
    }
}

fn description(path: &str, value: Value, expected: SdpKind) -> Result<SessionDescription, NegotiationError> {
    let desc: SessionDescription = record::parse(path, value)?;
    if desc.kind != expected {
        return Err(NegotiationError::Malformed {
            path: path.to_owned(),
            reason: format!("expected {expected:?}, got {:?}", desc.kind),
        });
    }
    Ok(desc)
}

/// Typed view of the call records in a [`SignalingStore`].
///
/// Holds no state of its own; every method is one or two store operations.
/// Payloads read back are validated and surface as [`NegotiationError`].
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn SignalingStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SignalingStore> {
        &self.store
    }

    pub async fn read_once(&self, path: &str) -> Result<Option<Value>, SignalingError> {
        self.store.read_once(path).await
    }

    pub async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<Subscription, SignalingError> {
        self.store.subscribe(path, on_change).await
    }

    pub async fn write(&self, path: &str, value: Value) -> Result<(), SignalingError> {
        self.store.write(path, value).await
    }

    pub async fn update_fields(
        &self,
        path: &str,
        fields: Map<String, Value>,
    ) -> Result<(), SignalingError> {
        self.store.update_fields(path, fields).await
    }

    pub async fn append(&self, path: &str, value: Value) -> Result<String, SignalingError> {
        self.store.append(path, value).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), SignalingError> {
        self.store.remove(path).await
    }

    async fn ensure_unwritten(&self, path: &str) -> Result<(), CallError> {
        if self.store.read_once(path).await?.is_some() {
            return Err(NegotiationError::AlreadyWritten {
                path: path.to_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Writes the record fields together with the caller's offer.
    ///
    /// Fields are patched rather than replaced so candidates that raced ahead
    /// of the record survive.
    pub async fn create_call(
        &self,
        call_id: &str,
        record: &CallRecord,
        offer: &SessionDescription,
    ) -> Result<(), CallError> {
        let path = record::call_path(call_id);
        self.ensure_unwritten(&record::offer_path(call_id)).await?;
        let mut fields = to_fields(&path, record)?;
        fields.insert("offer".into(), to_value(&path, offer)?);
        self.store.update_fields(&path, fields).await?;
        debug!(call_id, "call record created");
        Ok(())
    }

    pub async fn publish_answer(
        &self,
        call_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), CallError> {
        let path = record::answer_path(call_id);
        self.ensure_unwritten(&path).await?;
        self.store.write(&path, to_value(&path, answer)?).await?;
        debug!(call_id, "answer published");
        Ok(())
    }

    pub async fn read_record(&self, call_id: &str) -> Result<Option<CallRecord>, CallError> {
        let path = record::call_path(call_id);
        match self.store.read_once(&path).await? {
            Some(value) => Ok(Some(record::parse(&path, value)?)),
            None => Ok(None),
        }
    }

    pub async fn read_offer(&self, call_id: &str) -> Result<SessionDescription, CallError> {
        let path = record::offer_path(call_id);
        let value = self
            .store
            .read_once(&path)
            .await?
            .ok_or_else(|| NegotiationError::MissingOffer(call_id.to_owned()))?;
        Ok(description(&path, value, SdpKind::Offer)?)
    }

    /// Sets `status`, stamping `answeredAt` on accept and `endedAt` on a terminal status.
    pub async fn set_status(
        &self,
        call_id: &str,
        status: RecordStatus,
        at: i64,
    ) -> Result<(), CallError> {
        let path = record::call_path(call_id);
        let mut fields = Map::new();
        fields.insert("status".into(), to_value(&path, &status)?);
        if status == RecordStatus::Accepted {
            fields.insert("answeredAt".into(), Value::from(at));
        } else if status.is_terminal() {
            fields.insert("endedAt".into(), Value::from(at));
        }
        self.store.update_fields(&path, fields).await?;
        debug!(call_id, ?status, "record status written");
        Ok(())
    }

    pub async fn append_candidate(
        &self,
        call_id: &str,
        party_id: &str,
        candidate: &IceCandidate,
    ) -> Result<String, CallError> {
        let path = record::candidates_path(call_id, party_id);
        let key = self.store.append(&path, to_value(&path, candidate)?).await?;
        Ok(key)
    }

    /// Watches the record fields; `Ok(None)` means the record was removed.
    ///
    /// Fires only when a record field changes, not on offer, answer or
    /// candidate writes below it.
    pub async fn watch_record(
        &self,
        call_id: &str,
        on_change: impl Fn(Result<Option<CallRecord>, NegotiationError>) + Send + Sync + 'static,
    ) -> Result<Subscription, CallError> {
        let path = record::call_path(call_id);
        let last: Mutex<Option<Option<CallRecord>>> = Mutex::new(None);
        let parse_path = path.clone();
        let callback: ChangeCallback = Arc::new(move |value| {
            let parsed = match value {
                Some(value) => match record::parse::<CallRecord>(&parse_path, value) {
                    Ok(rec) => Some(rec),
                    Err(e) => return on_change(Err(e)),
                },
                None => None,
            };
            {
                let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                if last.as_ref() == Some(&parsed) {
                    return;
                }
                *last = Some(parsed.clone());
            }
            on_change(Ok(parsed));
        });
        Ok(self.store.subscribe(&path, callback).await?)
    }

    /// Fires once the receiver's answer is present.
    pub async fn watch_answer(
        &self,
        call_id: &str,
        on_answer: impl Fn(Result<SessionDescription, NegotiationError>) + Send + Sync + 'static,
    ) -> Result<Subscription, CallError> {
        let path = record::answer_path(call_id);
        let parse_path = path.clone();
        let callback: ChangeCallback = Arc::new(move |value| {
            if let Some(value) = value {
                on_answer(description(&parse_path, value, SdpKind::Answer));
            }
        });
        Ok(self.store.subscribe(&path, callback).await?)
    }

    /// Delivers each candidate `party_id` appends, once, in key order.
    pub async fn watch_candidates(
        &self,
        call_id: &str,
        party_id: &str,
        on_candidate: impl Fn(Result<IceCandidate, NegotiationError>) + Send + Sync + 'static,
    ) -> Result<Subscription, CallError> {
        let path = record::candidates_path(call_id, party_id);
        let seen: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let parse_path = path.clone();
        let callback: ChangeCallback = Arc::new(move |value| {
            let Some(Value::Object(entries)) = value else {
                return;
            };
            let mut fresh: Vec<(String, Value)> = {
                let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
                entries
                    .into_iter()
                    .filter(|(key, _)| seen.insert(key.clone()))
                    .collect()
            };
            fresh.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in fresh {
                let entry_path = format!("{parse_path}/{key}");
                on_candidate(record::parse(&entry_path, value));
            }
        });
        Ok(self.store.subscribe(&path, callback).await?)
    }

    /// Points the receiver's inbound path at this call.
    pub async fn ring(&self, receiver_id: &str, incoming: &IncomingCall) -> Result<(), CallError> {
        let path = record::incoming_path(receiver_id);
        self.store.write(&path, to_value(&path, incoming)?).await?;
        debug!(receiver_id, call_id = %incoming.call_id, "ringing receiver");
        Ok(())
    }

    pub async fn watch_incoming(
        &self,
        party_id: &str,
        on_incoming: impl Fn(Result<Option<IncomingCall>, NegotiationError>) + Send + Sync + 'static,
    ) -> Result<Subscription, CallError> {
        let path = record::incoming_path(party_id);
        let parse_path = path.clone();
        let callback: ChangeCallback = Arc::new(move |value| {
            on_incoming(value.map(|v| record::parse(&parse_path, v)).transpose());
        });
        Ok(self.store.subscribe(&path, callback).await?)
    }

    /// Removes the inbound pointer, but only while it still names `call_id`.
    pub async fn clear_incoming(&self, party_id: &str, call_id: &str) -> Result<bool, CallError> {
        let path = record::incoming_path(party_id);
        let current = match self.store.read_once(&path).await? {
            Some(value) => record::parse::<IncomingCall>(&path, value).ok(),
            None => return Ok(false),
        };
        if current.is_some_and(|c| c.call_id != call_id) {
            warn!(party_id, call_id, "inbound pointer moved on, leaving it");
            return Ok(false);
        }
        self.store.remove(&path).await?;
        Ok(true)
    }

    pub async fn remove_call(&self, call_id: &str) -> Result<(), CallError> {
        self.store.remove(&record::call_path(call_id)).await?;
        debug!(call_id, "call record removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MediaKind;
    use serde_json::json;

    fn channel() -> (SignalingChannel, MemoryStore) {
        let store = MemoryStore::new();
        (SignalingChannel::new(Arc::new(store.clone())), store)
    }

    fn record() -> CallRecord {
        CallRecord {
            caller_id: "alice".into(),
            caller_name: "Alice".into(),
            caller_photo: None,
            receiver_id: "bob".into(),
            receiver_name: "Bob".into(),
            kind: MediaKind::Audio,
            status: RecordStatus::Pending,
            created_at: 10,
            answered_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn offer_and_answer_are_written_once() {
        let (ch, _store) = channel();
        ch.create_call("c1", &record(), &SessionDescription::offer("o"))
            .await
            .unwrap();
        let again = ch
            .create_call("c1", &record(), &SessionDescription::offer("o2"))
            .await
            .unwrap_err();
        assert!(matches!(
            again,
            CallError::Negotiation(NegotiationError::AlreadyWritten { .. })
        ));

        ch.publish_answer("c1", &SessionDescription::answer("a")).await.unwrap();
        assert!(ch
            .publish_answer("c1", &SessionDescription::answer("a2"))
            .await
            .is_err());
        assert_eq!(ch.read_offer("c1").await.unwrap().sdp, "o");
    }

    #[tokio::test]
    async fn create_call_keeps_early_candidates() {
        let (ch, store) = channel();
        ch.append_candidate("c1", "bob", &IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        ch.create_call("c1", &record(), &SessionDescription::offer("o"))
            .await
            .unwrap();
        assert!(store.snapshot("calls/c1/candidates/bob").is_some());
        assert_eq!(ch.read_record("c1").await.unwrap().unwrap(), record());
    }

    #[tokio::test]
    async fn missing_offer_is_reported() {
        let (ch, _store) = channel();
        let err = ch.read_offer("nope").await.unwrap_err();
        assert_eq!(
            err,
            CallError::Negotiation(NegotiationError::MissingOffer("nope".into()))
        );
    }

    #[tokio::test]
    async fn answer_in_offer_slot_is_malformed() {
        let (ch, store) = channel();
        store
            .write("calls/c1/offer", json!({"type": "answer", "sdp": "x"}))
            .await
            .unwrap();
        let err = ch.read_offer("c1").await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Negotiation(NegotiationError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn status_stamps_timestamps() {
        let (ch, _store) = channel();
        ch.create_call("c1", &record(), &SessionDescription::offer("o"))
            .await
            .unwrap();
        ch.set_status("c1", RecordStatus::Accepted, 20).await.unwrap();
        ch.set_status("c1", RecordStatus::Ended, 30).await.unwrap();
        let rec = ch.read_record("c1").await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Ended);
        assert_eq!(rec.answered_at, Some(20));
        assert_eq!(rec.ended_at, Some(30));
    }

    #[tokio::test]
    async fn watch_record_ignores_child_writes_and_reports_removal() {
        let (ch, _store) = channel();
        ch.create_call("c1", &record(), &SessionDescription::offer("o"))
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ch
            .watch_record("c1", move |r| {
                sink.lock().unwrap().push(r.unwrap().map(|r| r.status));
            })
            .await
            .unwrap();

        ch.append_candidate("c1", "alice", &IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        ch.set_status("c1", RecordStatus::Rejected, 5).await.unwrap();
        ch.remove_call("c1").await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Some(RecordStatus::Pending),
                Some(RecordStatus::Rejected),
                None
            ]
        );
    }

    #[tokio::test]
    async fn candidates_are_delivered_once_in_order() {
        let (ch, store) = channel();
        ch.append_candidate("c1", "alice", &IceCandidate::new("candidate:0"))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ch
            .watch_candidates("c1", "alice", move |c| {
                sink.lock().unwrap().push(c.map(|c| c.candidate));
            })
            .await
            .unwrap();

        for i in 1..4 {
            ch.append_candidate("c1", "alice", &IceCandidate::new(format!("candidate:{i}")))
                .await
                .unwrap();
        }
        // the other party's list is not ours
        ch.append_candidate("c1", "bob", &IceCandidate::new("candidate:b"))
            .await
            .unwrap();
        store
            .append("calls/c1/candidates/alice", json!({"sdpMid": 3}))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let ok: Vec<String> = seen.iter().filter_map(|c| c.clone().ok()).collect();
        assert_eq!(
            ok,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
        assert_eq!(seen.len(), 5);
        assert!(seen[4].is_err());
    }

    #[tokio::test]
    async fn clear_incoming_only_removes_own_pointer() {
        let (ch, store) = channel();
        let incoming = IncomingCall::for_record("c1", &record());
        ch.ring("bob", &incoming).await.unwrap();

        assert!(!ch.clear_incoming("bob", "c2").await.unwrap());
        assert!(store.snapshot("incoming/bob").is_some());
        assert!(ch.clear_incoming("bob", "c1").await.unwrap());
        assert!(store.snapshot("incoming/bob").is_none());
        assert!(!ch.clear_incoming("bob", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn incoming_watch_sees_ring_and_clear() {
        let (ch, _store) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ch
            .watch_incoming("bob", move |i| {
                sink.lock().unwrap().push(i.unwrap().map(|i| i.call_id));
            })
            .await
            .unwrap();
        ch.ring("bob", &IncomingCall::for_record("c1", &record()))
            .await
            .unwrap();
        ch.clear_incoming("bob", "c1").await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("c1".to_string()), None]
        );
    }

    #[tokio::test]
    async fn outage_surfaces_as_signaling_error() {
        let (ch, store) = channel();
        store.set_offline(true);
        let err = ch
            .create_call("c1", &record(), &SessionDescription::offer("o"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Signaling(SignalingError::Unavailable(_))));
    }
}

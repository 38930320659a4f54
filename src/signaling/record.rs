use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::NegotiationError;
use crate::session::{MediaKind, RecordStatus};

pub fn call_path(call_id: &str) -> String {
    format!("calls/{call_id}")
}

pub fn offer_path(call_id: &str) -> String {
    format!("calls/{call_id}/offer")
}

pub fn answer_path(call_id: &str) -> String {
    format!("calls/{call_id}/answer")
}

pub fn candidates_path(call_id: &str, party_id: &str) -> String {
    format!("calls/{call_id}/candidates/{party_id}")
}

/// Inbound-call path of a party.
pub fn incoming_path(party_id: &str) -> String {
    format!("incoming/{party_id}")
}

/// Record fields stored at `calls/{callId}`.
///
/// `offer`, `answer` and `candidates` live under the same node but are read
/// through their own paths, so they are not part of this struct.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub caller_id: String,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_photo: Option<String>,
    pub receiver_id: String,
    pub receiver_name: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub status: RecordStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

/// Pointer written to the receiver's inbound-call path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_photo: Option<String>,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub created_at: i64,
}

impl IncomingCall {
    pub fn for_record(call_id: &str, record: &CallRecord) -> Self {
        Self {
            call_id: call_id.to_owned(),
            caller_id: record.caller_id.clone(),
            caller_name: record.caller_name.clone(),
            caller_photo: record.caller_photo.clone(),
            kind: record.kind,
            created_at: record.created_at,
        }
    }
}

/// Validates a store payload against its schema.
pub fn parse<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, NegotiationError> {
    serde_json::from_value(value).map_err(|e| NegotiationError::Malformed {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

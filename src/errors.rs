use thiserror::Error;

use crate::session::CallStatus;

/// Local capture device could not be opened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device available")]
    DeviceNotFound(String),
    #[error("{0} device is busy")]
    DeviceBusy(String),
}

/// Failure talking to the shared signaling store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{op} failed at {path}: {reason}")]
    Operation {
        op: &'static str,
        path: String,
        reason: String,
    },
}

/// Missing or malformed negotiation payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no offer stored for call {0}")]
    MissingOffer(String),
    #[error("malformed payload at {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("{path} was already written")]
    AlreadyWritten { path: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("another call is in progress (status {0:?})")]
    Busy(CallStatus),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Peer(e.to_string())
    }
}

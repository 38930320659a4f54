use serde::{Deserialize, Serialize};

use crate::media::{MediaStream, TrackKind};

/// Negotiation status of the local party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Ringing,
    Connected,
    Ended,
}

/// `status` field of the shared call record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Accepted,
    Rejected,
    Ended,
    Missed,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended | Self::Missed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Connectivity banner value shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    New,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartyInfo {
    pub id: String,
    pub name: String,
    pub photo: Option<String>,
}

impl PartyInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            photo: None,
        }
    }

    pub fn with_photo(mut self, photo: impl Into<String>) -> Self {
        self.photo = Some(photo.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Observable state of the local party's call.
///
/// Owned by the coordinator and published to observers as a snapshot; an
/// idle session carries no call id and no stream.
#[derive(Debug, Clone, Default)]
pub struct CallSession {
    pub call_id: Option<String>,
    pub role: Option<CallRole>,
    pub caller: PartyInfo,
    pub receiver: PartyInfo,
    pub kind: MediaKind,
    pub status: CallStatus,
    pub record_status: Option<RecordStatus>,
    pub created_at: Option<i64>,
    pub answered_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub muted: bool,
    pub camera_off: bool,
    pub facing: FacingMode,
    pub duration_secs: u64,
    pub connectivity: Connectivity,
    pub local_stream: Option<MediaStream>,
    pub remote_tracks: Vec<RemoteTrack>,
}

impl CallSession {
    pub fn idle() -> Self {
        Self::default()
    }

    /// The other party, seen from `role`.
    pub fn peer(&self) -> &PartyInfo {
        match self.role {
            Some(CallRole::Callee) => &self.caller,
            _ => &self.receiver,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, CallStatus::Idle | CallStatus::Ended)
    }
}

/// Why a call left the active states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    RejectedLocally,
    RejectedByPeer,
    Missed,
    ConnectionFailed,
    RecordRemoved,
    SetupFailed(String),
    /// Released through [`crate::CallCoordinator::cleanup`] without telling the peer.
    Aborted,
    Shutdown,
}

/// Discrete notifications next to the [`CallSession`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StatusChanged { call_id: String, status: CallStatus },
    ConnectivityChanged { call_id: String, state: Connectivity },
    RemoteTrackAdded { call_id: String, track: RemoteTrack },
    Ended { call_id: String, reason: EndReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_record_statuses() {
        assert!(!RecordStatus::Pending.is_terminal());
        assert!(!RecordStatus::Accepted.is_terminal());
        assert!(RecordStatus::Rejected.is_terminal());
        assert!(RecordStatus::Ended.is_terminal());
        assert!(RecordStatus::Missed.is_terminal());
    }

    #[test]
    fn facing_flips() {
        assert_eq!(FacingMode::User.opposite(), FacingMode::Environment);
        assert_eq!(FacingMode::Environment.opposite(), FacingMode::User);
    }

    #[test]
    fn peer_depends_on_role() {
        let mut s = CallSession::idle();
        s.caller = PartyInfo::new("a", "Alice").with_photo("a.png");
        s.receiver = PartyInfo::new("b", "Bob");
        s.role = Some(CallRole::Callee);
        assert_eq!(s.peer().id, "a");
        assert_eq!(s.peer().photo.as_deref(), Some("a.png"));
        s.role = Some(CallRole::Caller);
        assert_eq!(s.peer().id, "b");
        assert!(!s.is_active());
    }
}

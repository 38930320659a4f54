//! Two-party call negotiation over a shared key-value signaling store.
//!
//! A [`CallCoordinator`] per party drives the offer/answer exchange, trickles
//! ICE candidates through the store and owns the local media and peer
//! connection of the call in progress.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::CallConfig;
pub use coordinator::CallCoordinator;
pub use errors::{CallError, MediaAccessError, NegotiationError, SignalingError};
pub use logger::init_logging;
pub use media::{CaptureDevices, LocalTrack, MediaDevices, MediaManager, MediaStream, TrackKind};
pub use peer::{PeerConnection, PeerConnector, PeerEvent, RtcConnector};
pub use session::{
    CallEvent, CallRole, CallSession, CallStatus, Connectivity, EndReason, FacingMode, MediaKind,
    PartyInfo, RecordStatus,
};
pub use signaling::{MemoryStore, SignalingChannel, SignalingStore, Subscription};
